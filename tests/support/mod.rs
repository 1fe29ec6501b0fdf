//! Shared end-to-end test harness: wires two [`IceSession`]s together over an
//! in-process packet bus standing in for the socket layer (spec §1 scopes the
//! real UDP socket/TURN relay out of this crate), in the style of
//! `nyx-transport/tests/integration.rs`'s direct-exercise-the-API tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ice_rudp::ice::IceSession;
use ice_rudp::stun::{looks_like_stun, StunMessage};
use tokio::sync::mpsc;

/// Forwards every packet `sender` emits on `outbound_rx` to `receiver`,
/// classifying STUN vs. data the way the socket layer would, and routes any
/// STUN reply straight back to `sender`. Spawns a background task; call once
/// per direction to fully wire a pair of sessions together.
pub fn pump(
    outbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    sender_addr: SocketAddr,
    sender: Arc<IceSession>,
    receiver: Arc<IceSession>,
) {
    pump_gated(outbound_rx, sender_addr, sender, receiver);
}

/// Same as [`pump`], but returns a shared gate the caller can clear to
/// silently drop every subsequent packet in this direction — standing in for
/// a dead network path (spec §8 scenario 4) without tearing down the channel.
pub fn pump_gated(
    mut outbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    sender_addr: SocketAddr,
    sender: Arc<IceSession>,
    receiver: Arc<IceSession>,
) -> Arc<AtomicBool> {
    let gate = Arc::new(AtomicBool::new(true));
    let task_gate = gate.clone();
    tokio::spawn(async move {
        while let Some((_dest, packet)) = outbound_rx.recv().await {
            if !task_gate.load(Ordering::SeqCst) {
                continue;
            }
            if looks_like_stun(&packet) {
                let Ok(msg) = StunMessage::decode(&packet) else { continue };
                if let Some(response) = receiver.handle_stun_packet(sender_addr, &msg).await {
                    if let Ok(encoded) = response.encode() {
                        if let Ok(decoded) = StunMessage::decode(&encoded) {
                            sender.handle_stun_packet(sender_addr, &decoded).await;
                        }
                    }
                }
            } else {
                receiver.handle_packet(sender_addr, packet.to_vec()).await;
            }
        }
    });
    gate
}

/// Waits (polling) until `predicate` holds or `timeout` elapses, returning
/// whether it held. Used instead of a fixed `sleep` so tests settle as soon
/// as the async state machines converge rather than waiting a worst case.
pub async fn wait_until<F, Fut>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
