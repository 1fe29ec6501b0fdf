//! RUDP channel: a logical ordered/reliable byte stream over a nominated ICE
//! pair, established and torn down with STUN, carrying its payload through an
//! injected [`ReliableStream`].
//!
//! Grounded directly in `services_RUDPChannel.h`'s `RUDPChannel`: the three
//! factory methods, the pending-send buffer list, the outstanding-ACK map, the
//! `mSTUNRequestPreviouslyTimedOut` skip-close optimization, and the
//! graceful-shutdown self-reference pattern (`mGracefulShutdownReference`,
//! rendered here as an `Arc` the channel clones into its own shutdown task
//! instead of a raw self-referential pointer).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::config::RudpChannelConfig;
use crate::error::{ErrorReason, LastError};
use crate::stun::{AttributeType, MessageType, StunMessage};
use crate::stun_requester::{RetryProfile, StunRequester, StunRequesterSink};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RudpError {
    #[error("channel already shut down")]
    Closed,
    #[error("stun codec error: {0}")]
    Stun(String),
    #[error("peer rejected channel open: {0:?}")]
    OpenRejected(crate::stun::ErrorCode),
}

pub type RudpResult<T> = Result<T, RudpError>;

/// Lifecycle states (spec §4.3, mirrors `RUDPChannelStates`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    ShuttingDown,
    Shutdown,
}

/// Half-close direction (mirrors `IRUDPChannelStream::Shutdown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    None,
    Send,
    Receive,
    Both,
}

/// Events delivered to the owner (spec §6).
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    ReadReady,
    WriteReady,
}

/// The reliable-stream engine this channel is a transport for. Treated strictly
/// as an injected black box per spec §1/§4.3.4: this crate does not implement
/// retransmission, reordering, or flow control for the byte stream itself.
#[async_trait]
pub trait ReliableStream: Send + Sync {
    /// Hands inbound channel payload bytes to the stream for reassembly.
    async fn handle_packet(&self, bytes: &[u8]);

    /// Accepts outbound application bytes. `true` if accepted.
    async fn send(&self, bytes: &[u8]) -> bool;

    /// Number of reassembled bytes immediately available to [`RudpChannel::receive`].
    async fn receive_size_available(&self) -> usize;

    /// Drains up to `max_len` reassembled bytes.
    async fn receive(&self, max_len: usize) -> Vec<u8>;

    /// True once all previously accepted sends have been flushed to the wire.
    async fn is_send_flushed(&self) -> bool;

    /// True once the stream itself has reached a shutdown state (e.g. the peer
    /// half-closed and all data drained).
    async fn is_shutdown(&self) -> bool;

    async fn shutdown_direction(&self, direction: ShutdownDirection);
}

struct CheckSink {
    outbound: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl StunRequesterSink for CheckSink {
    async fn send_packet(&self, _destination: SocketAddr, packet: Bytes) {
        let _ = self.outbound.send(packet);
    }

    async fn on_response(&self, _response: &StunMessage) -> bool {
        // Matching and integrity verification happen in the channel's own
        // handle_open_response/handle_stun_response before this is called, so
        // acceptance here is unconditional.
        true
    }

    async fn on_timed_out(&self) {}
}

struct PendingSend {
    bytes: Bytes,
}

struct Inner {
    state: ChannelState,
    shutdown_direction: ShutdownDirection,
    outgoing_channel_number: Option<u16>,
    remote_sequence_number: u64,
    remote_channel_info: String,
    realm: Option<String>,
    nonce: Option<String>,
    pending_buffers: VecDeque<PendingSend>,
    outstanding_acks: HashMap<u64, Arc<StunRequester<CheckSink>>>,
    open_request: Option<Arc<StunRequester<CheckSink>>>,
    refresh_request: Option<Arc<StunRequester<CheckSink>>>,
    shutdown_request: Option<Arc<StunRequester<CheckSink>>>,
    stun_request_previously_timed_out: bool,
    informed_read_ready: bool,
}

/// One reliable channel over a connected ICE route. See module docs.
pub struct RudpChannel {
    remote_ip: SocketAddr,
    local_ufrag: String,
    remote_ufrag: String,
    local_password: String,
    remote_password: String,
    incoming_channel_number: u16,
    local_sequence_number: u64,
    local_channel_info: String,
    config: RudpChannelConfig,
    stream: Arc<dyn ReliableStream>,
    inner: Mutex<Inner>,
    last_error: LastError,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    ack_ids: AtomicU64,
    shutdown_signal: Notify,
}

impl RudpChannel {
    /// `createForRUDPICESocketSessionOutgoing` (spec §4.3 factory c): the local
    /// side originates the open handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn create_outgoing(
        remote_ip: SocketAddr,
        local_ufrag: String,
        remote_ufrag: String,
        local_password: String,
        remote_password: String,
        incoming_channel_number: u16,
        local_channel_info: String,
        config: RudpChannelConfig,
        stream: Arc<dyn ReliableStream>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self::new_internal(
            remote_ip,
            local_ufrag,
            remote_ufrag,
            local_password,
            remote_password,
            incoming_channel_number,
            local_channel_info,
            config,
            stream,
            events,
            outbound,
        ));
        let handle = channel.clone();
        tokio::spawn(async move { handle.issue_open().await });
        channel
    }

    /// `createForRUDPICESocketSessionIncoming` / `createForListener` (spec §4.3
    /// factories a/b): the peer's `ChannelOpen` request is already in hand;
    /// answer it synchronously and adopt *Connected* immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn create_incoming(
        remote_ip: SocketAddr,
        local_ufrag: String,
        remote_ufrag: String,
        local_password: String,
        remote_password: String,
        incoming_channel_number: u16,
        local_channel_info: String,
        config: RudpChannelConfig,
        stream: Arc<dyn ReliableStream>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        open_request: &StunMessage,
    ) -> (Arc<Self>, StunMessage) {
        let channel = Arc::new(Self::new_internal(
            remote_ip,
            local_ufrag,
            remote_ufrag,
            local_password,
            remote_password,
            incoming_channel_number,
            local_channel_info,
            config,
            stream,
            events,
            outbound,
        ));

        let response = channel.accept_open_blocking(open_request);
        (channel, response)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_internal(
        remote_ip: SocketAddr,
        local_ufrag: String,
        remote_ufrag: String,
        local_password: String,
        remote_password: String,
        incoming_channel_number: u16,
        local_channel_info: String,
        config: RudpChannelConfig,
        stream: Arc<dyn ReliableStream>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    ) -> Self {
        Self {
            remote_ip,
            local_ufrag,
            remote_ufrag,
            local_password,
            remote_password,
            incoming_channel_number,
            local_sequence_number: rand::random(),
            local_channel_info,
            config,
            stream,
            inner: Mutex::new(Inner {
                state: ChannelState::Connecting,
                shutdown_direction: ShutdownDirection::None,
                outgoing_channel_number: None,
                remote_sequence_number: 0,
                remote_channel_info: String::new(),
                realm: None,
                nonce: None,
                pending_buffers: VecDeque::new(),
                outstanding_acks: HashMap::new(),
                open_request: None,
                refresh_request: None,
                shutdown_request: None,
                stun_request_previously_timed_out: false,
                informed_read_ready: false,
            }),
            last_error: LastError::new(),
            events,
            outbound,
            ack_ids: AtomicU64::new(1),
            shutdown_signal: Notify::new(),
        }
    }

    fn build_open_request(&self, realm: Option<&str>, nonce: Option<&str>) -> StunMessage {
        let mut request = StunMessage::new(MessageType::ChannelOpenRequest);
        request.add_username(&format!("{}:{}", self.remote_ufrag, self.local_ufrag));
        request.add_channel_number(self.incoming_channel_number);
        request.add_sequence_number(self.local_sequence_number);
        request.add_minimum_rtt(self.config.minimum_rtt.as_millis() as u32);
        request.add_lifetime(self.config.lifetime.as_secs() as u32);
        request.add_channel_info(&self.local_channel_info);
        if let Some(realm) = realm {
            request.add_realm(realm);
        }
        if let Some(nonce) = nonce {
            request.add_nonce(nonce);
        }
        let _ = request.add_message_integrity(&self.remote_password);
        let _ = request.add_fingerprint();
        request
    }

    /// spec §4.3.1: issue `ChannelOpen`, retry once on `STALE-NONCE`, adopt the
    /// peer's channel number/sequence/info on success, flush pending sends.
    #[instrument(skip(self))]
    async fn issue_open(self: Arc<Self>) {
        let mut realm = None;
        let mut nonce = None;

        loop {
            let request = self.build_open_request(realm.as_deref(), nonce.as_deref());
            let Ok(packet) = request.encode() else { return };

            let (tx, rx) = mpsc::unbounded_channel();
            let sink = CheckSink { outbound: tx };
            let requester = Arc::new(StunRequester::create(
                self.remote_ip,
                request,
                packet,
                RetryProfile::rfc5389_default(),
                sink,
            ));
            self.inner.lock().await.open_request = Some(requester.clone());
            self.relay_sink_output(rx);

            let handle = requester.clone();
            let outcome = handle.run().await;

            if matches!(outcome, Some(crate::stun_requester::TransactionOutcome::Succeeded)) {
                // `StunRequester::handle_candidate_response` only reports
                // `Succeeded` once `handle_open_response` has already run
                // `adopt_open_response`, so there's nothing left to apply here.
                return;
            }

            // Either the schedule was exhausted (`TimedOut`) or `handle_open_response`
            // canceled the transaction to retry with a fresh `STALE-NONCE` (`None`).
            // Both paths land here; a pending nonce distinguishes which happened.
            let retry_nonce = self.inner.lock().await.nonce.take();
            match retry_nonce {
                Some(n) => {
                    nonce = Some(n);
                    realm = self.inner.lock().await.realm.take();
                    continue;
                }
                None => {
                    if outcome.is_none() {
                        // Canceled for a reason other than STALE-NONCE retry (e.g.
                        // the channel was closed out from under the open attempt).
                        return;
                    }
                    self.inner.lock().await.stun_request_previously_timed_out = true;
                    self.shutdown_with(ErrorReason::Timeout).await;
                    return;
                }
            }
        }
    }

    /// The sink forwards encoded packets as plain bytes; this tags each one with
    /// the channel's remote address and forwards it to the session's outbound
    /// queue for the lifetime of the owning requester.
    fn relay_sink_output(&self, rx: mpsc::UnboundedReceiver<Bytes>) {
        let remote_ip = self.remote_ip;
        let outbound = self.outbound.clone();
        let mut rx = rx;
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let _ = outbound.send((remote_ip, packet));
            }
        });
    }

    /// Called by the owning session when a STUN response matching this
    /// channel's open transaction arrives.
    pub async fn handle_open_response(&self, response: &StunMessage) {
        let open_request = self.inner.lock().await.open_request.clone();
        let Some(requester) = open_request else { return };
        if requester.transaction_id() != response.header.transaction_id {
            return;
        }

        if response.header.message_type.is_error() {
            if let Ok(Some(crate::stun::ErrorCode::Unauthorized)) = response.get_error_code() {
                if let (Some(realm), Some(nonce)) = (response.get_realm(), response.get_nonce()) {
                    let mut inner = self.inner.lock().await;
                    inner.realm = Some(realm);
                    inner.nonce = Some(nonce);
                    drop(inner);
                    requester.cancel().await;
                    return;
                }
            }
            requester.cancel().await;
            self.shutdown_with(ErrorReason::Timeout).await;
            return;
        }

        if !matches!(response.verify_message_integrity(&self.local_password), Ok(true)) {
            return;
        }

        let accepted = requester.handle_candidate_response(response).await;
        if !accepted {
            return;
        }

        self.adopt_open_response(response).await;
    }

    async fn adopt_open_response(&self, response: &StunMessage) {
        let mut inner = self.inner.lock().await;
        inner.outgoing_channel_number = response.get_channel_number().ok().flatten();
        inner.remote_sequence_number = response.get_sequence_number().ok().flatten().unwrap_or(0);
        inner.remote_channel_info = response.get_channel_info().unwrap_or_default();
        inner.state = ChannelState::Connected;
        inner.open_request = None;
        let pending: Vec<Bytes> = inner.pending_buffers.drain(..).map(|p| p.bytes).collect();
        drop(inner);

        for bytes in pending {
            self.stream.send(&bytes).await;
        }

        info!("rudp channel connected");
        let _ = self.events.send(ChannelEvent::StateChanged(ChannelState::Connected));
        let _ = self.events.send(ChannelEvent::WriteReady);
    }

    /// The listener/session-incoming path: the open request is already in hand,
    /// so this answers it inline instead of through the requester machinery.
    fn accept_open_blocking(&self, request: &StunMessage) -> StunMessage {
        let mut response = request.reply(MessageType::ChannelOpenResponse);
        response.add_channel_number(self.incoming_channel_number);
        response.add_sequence_number(self.local_sequence_number);
        response.add_minimum_rtt(self.config.minimum_rtt.as_millis() as u32);
        response.add_lifetime(self.config.lifetime.as_secs() as u32);
        response.add_channel_info(&self.local_channel_info);
        let _ = response.add_message_integrity(&self.local_password);
        let _ = response.add_fingerprint();
        response
    }

    /// Call once a `create_incoming` channel's response has actually been sent,
    /// so the channel itself transitions to *Connected* and flushes any sends
    /// queued in the meantime.
    pub async fn mark_accepted(self: &Arc<Self>, open_request: &StunMessage) {
        let mut inner = self.inner.lock().await;
        inner.outgoing_channel_number = Some(self.incoming_channel_number);
        inner.remote_sequence_number = open_request.get_sequence_number().ok().flatten().unwrap_or(0);
        inner.remote_channel_info = open_request.get_channel_info().unwrap_or_default();
        inner.state = ChannelState::Connected;
        let pending: Vec<Bytes> = inner.pending_buffers.drain(..).map(|p| p.bytes).collect();
        drop(inner);

        for bytes in pending {
            self.stream.send(&bytes).await;
        }
        let _ = self.events.send(ChannelEvent::StateChanged(ChannelState::Connected));
        let _ = self.events.send(ChannelEvent::WriteReady);
    }

    /// spec §4.3 `send(bytes)`.
    pub async fn send(&self, bytes: Bytes) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ChannelState::Connecting => {
                inner.pending_buffers.push_back(PendingSend { bytes });
                true
            }
            ChannelState::Connected => {
                if matches!(inner.shutdown_direction, ShutdownDirection::Send | ShutdownDirection::Both) {
                    return false;
                }
                drop(inner);
                self.stream.send(&bytes).await
            }
            ChannelState::ShuttingDown | ChannelState::Shutdown => false,
        }
    }

    pub async fn receive_size_available(&self) -> usize {
        self.stream.receive_size_available().await
    }

    pub async fn receive(&self, max_len: usize) -> Vec<u8> {
        let bytes = self.stream.receive(max_len).await;
        if self.stream.receive_size_available().await == 0 {
            self.inner.lock().await.informed_read_ready = false;
        }
        bytes
    }

    /// Wraps and forwards a reassembled application packet from the parent
    /// session's `handleRUDP` dispatch (channel-number discriminator already
    /// stripped by the caller). Latched like write-ready: no duplicate
    /// `ReadReady` fires until an intervening `receive()` drains the stream
    /// back to empty.
    pub async fn handle_rudp(&self, payload: &[u8]) {
        self.stream.handle_packet(payload).await;
        let mut inner = self.inner.lock().await;
        if !inner.informed_read_ready {
            inner.informed_read_ready = true;
            drop(inner);
            let _ = self.events.send(ChannelEvent::ReadReady);
        }
    }

    /// spec §4.3 `handleSTUN`: routes `ChannelRefresh`/`ChannelClose` requests
    /// addressed to this channel, and hands anything else (open/refresh/close
    /// responses, external-ack responses) to [`Self::handle_stun_response`].
    pub async fn handle_stun(&self, message: &StunMessage) -> Option<StunMessage> {
        match message.header.message_type {
            MessageType::ChannelRefreshRequest => Some(self.handle_refresh_request(message)),
            MessageType::ChannelCloseRequest => Some(self.handle_close_request(message).await),
            _ if message.header.message_type.is_request() => None,
            _ => {
                self.handle_stun_response(message).await;
                None
            }
        }
    }

    /// Routes an inbound STUN response to whichever outstanding transaction it
    /// matches by transaction id (open, refresh, close, or an external-ack),
    /// feeding it to that transaction's [`StunRequester`] so `.run()` resolves.
    pub async fn handle_stun_response(&self, response: &StunMessage) {
        if matches!(response.header.message_type, MessageType::ChannelOpenResponse | MessageType::ChannelOpenErrorResponse) {
            self.handle_open_response(response).await;
            return;
        }

        if !matches!(response.verify_message_integrity(&self.local_password), Ok(true)) {
            return;
        }

        let candidates = {
            let inner = self.inner.lock().await;
            let mut found = Vec::new();
            found.extend(inner.refresh_request.clone());
            found.extend(inner.shutdown_request.clone());
            found.extend(inner.outstanding_acks.values().cloned());
            found
        };

        for requester in candidates {
            if requester.transaction_id() == response.header.transaction_id {
                requester.handle_candidate_response(response).await;
                return;
            }
        }
    }

    fn handle_refresh_request(&self, request: &StunMessage) -> StunMessage {
        let mut response = request.reply(MessageType::ChannelRefreshResponse);
        response.add_lifetime(self.config.lifetime.as_secs() as u32);
        let _ = response.add_message_integrity(&self.local_password);
        let _ = response.add_fingerprint();
        response
    }

    async fn handle_close_request(&self, request: &StunMessage) -> StunMessage {
        self.shutdown_with(ErrorReason::Closed).await;
        let mut response = request.reply(MessageType::ChannelCloseResponse);
        let _ = response.add_message_integrity(&self.local_password);
        let _ = response.add_fingerprint();
        response
    }

    /// spec §4.3.2: periodic refresh, called by the scheduler every
    /// `RudpChannelConfig::refresh_interval`.
    #[instrument(skip(self))]
    pub async fn refresh_tick(self: &Arc<Self>) {
        if self.inner.lock().await.state != ChannelState::Connected {
            return;
        }

        let mut request = StunMessage::new(MessageType::ChannelRefreshRequest);
        request.add_username(&format!("{}:{}", self.remote_ufrag, self.local_ufrag));
        request.add_lifetime(self.config.lifetime.as_secs() as u32);
        let _ = request.add_message_integrity(&self.remote_password);
        let _ = request.add_fingerprint();

        let Ok(packet) = request.encode() else { return };
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = CheckSink { outbound: tx };
        let requester = Arc::new(StunRequester::create(self.remote_ip, request, packet, RetryProfile::rfc5389_default(), sink));
        self.relay_sink_output(rx);
        self.inner.lock().await.refresh_request = Some(requester.clone());

        // Drive off the scheduler's refresh-driver loop: the full retry
        // schedule can span seconds, and the loop must stay free to resolve
        // the next channel in the registry.
        let channel = self.clone();
        tokio::spawn(async move {
            let outcome = requester.run().await;
            channel.inner.lock().await.refresh_request = None;
            if outcome == Some(crate::stun_requester::TransactionOutcome::TimedOut) {
                warn!("rudp channel refresh timed out");
                channel.shutdown_with(ErrorReason::Timeout).await;
            }
        });
    }

    /// spec §4.3.3 graceful `shutdown()`: flush outstanding sends, then
    /// exchange `ChannelClose` unless a prior request already timed out.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == ChannelState::Shutdown {
                return;
            }
            inner.state = ChannelState::ShuttingDown;
        }
        let _ = self.events.send(ChannelEvent::StateChanged(ChannelState::ShuttingDown));

        // Self-reference so the flush-then-close task outlives any external
        // `Arc<RudpChannel>` being dropped mid-shutdown (mirrors
        // `mGracefulShutdownReference` in the original).
        let keep_alive = self.clone();
        tokio::spawn(async move { keep_alive.drive_graceful_shutdown().await });
    }

    async fn drive_graceful_shutdown(self: Arc<Self>) {
        while !self.stream.is_send_flushed().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let previously_timed_out = self.inner.lock().await.stun_request_previously_timed_out;
        if previously_timed_out {
            debug!("skipping ChannelClose exchange: peer already unreachable");
            self.shutdown_with(ErrorReason::Closed).await;
            return;
        }

        let mut request = StunMessage::new(MessageType::ChannelCloseRequest);
        request.add_username(&format!("{}:{}", self.remote_ufrag, self.local_ufrag));
        let _ = request.add_message_integrity(&self.remote_password);
        let _ = request.add_fingerprint();
        let Ok(packet) = request.encode() else {
            self.shutdown_with(ErrorReason::Closed).await;
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = CheckSink { outbound: tx };
        let requester = Arc::new(StunRequester::create(self.remote_ip, request, packet, RetryProfile::rfc5389_default(), sink));
        self.relay_sink_output(rx);
        self.inner.lock().await.shutdown_request = Some(requester.clone());

        let _ = requester.run().await;
        self.shutdown_with(ErrorReason::Closed).await;
    }

    /// spec §4.3.3 `shutdownFromTimeout`: forces immediate *Shutdown* without
    /// the close exchange (called when the parent session itself is tearing down).
    pub async fn shutdown_from_timeout(&self) {
        self.shutdown_with(ErrorReason::Timeout).await;
    }

    pub async fn shutdown_direction(&self, direction: ShutdownDirection) {
        self.inner.lock().await.shutdown_direction = direction;
        self.stream.shutdown_direction(direction).await;
    }

    async fn shutdown_with(&self, reason: ErrorReason) {
        let already = self.last_error.is_set();
        self.last_error.set(reason);
        if already {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.state == ChannelState::Shutdown {
            return;
        }
        for (_, ack) in inner.outstanding_acks.drain() {
            tokio::spawn(async move { ack.cancel().await });
        }
        if let Some(req) = inner.open_request.take() {
            tokio::spawn(async move { req.cancel().await });
        }
        if let Some(req) = inner.refresh_request.take() {
            tokio::spawn(async move { req.cancel().await });
        }
        if let Some(req) = inner.shutdown_request.take() {
            tokio::spawn(async move { req.cancel().await });
        }
        inner.state = ChannelState::Shutdown;
        drop(inner);

        self.shutdown_signal.notify_waiters();
        debug!(?reason, "rudp channel shut down");
        let _ = self.events.send(ChannelEvent::StateChanged(ChannelState::Shutdown));
    }

    /// spec §4.3.4 external-ACK-now: the reliable stream requests an explicit
    /// acknowledgement with a delivery guarantee. Tracks the request in the
    /// outstanding-ACK table until it resolves.
    pub async fn request_external_ack_now(self: &Arc<Self>, guarantee_delivery: bool) -> u64 {
        let ack_id = self.ack_ids.fetch_add(1, Ordering::Relaxed);
        if !guarantee_delivery {
            return ack_id;
        }

        let mut request = StunMessage::new(MessageType::ChannelRefreshRequest);
        request.add_sequence_number(ack_id);
        let _ = request.add_message_integrity(&self.remote_password);
        let _ = request.add_fingerprint();
        let Ok(packet) = request.encode() else { return ack_id };

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = CheckSink { outbound: tx };
        let requester = Arc::new(StunRequester::create(self.remote_ip, request, packet, RetryProfile::rfc5389_default(), sink));
        self.relay_sink_output(rx);
        self.inner.lock().await.outstanding_acks.insert(ack_id, requester.clone());

        let channel = self.clone();
        tokio::spawn(async move {
            requester.run().await;
            channel.inner.lock().await.outstanding_acks.remove(&ack_id);
        });

        ack_id
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    pub async fn last_error(&self) -> ErrorReason {
        self.last_error.get()
    }

    pub async fn is_pending_empty(&self) -> bool {
        self.inner.lock().await.pending_buffers.is_empty()
    }
}

/// Field id reused from the STUN attribute set to describe the data-plane
/// channel-number discriminator's width (spec §6 "bytes prefixed with the
/// channel-number discriminator"); kept for documentation/debug purposes
/// alongside [`frame_data`]/[`parse_frame`], which do the actual framing.
pub const CHANNEL_NUMBER_ATTRIBUTE: AttributeType = AttributeType::ChannelNumber;

/// Prefixes `payload` with `channel_number` (spec §6 data-plane framing) so
/// the session's outbound path can multiplex several channels over one
/// nominated pair.
pub fn frame_data(channel_number: u16, payload: &[u8]) -> Bytes {
    let mut buf = bytes::BytesMut::with_capacity(2 + payload.len());
    buf.extend_from_slice(&channel_number.to_be_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Strips the channel-number discriminator a matching [`frame_data`] added,
/// returning `(channel_number, payload)`, or `None` if `bytes` is too short
/// to carry the 2-byte prefix.
pub fn parse_frame(bytes: &[u8]) -> Option<(u16, &[u8])> {
    if bytes.len() < 2 {
        return None;
    }
    let channel_number = u16::from_be_bytes([bytes[0], bytes[1]]);
    Some((channel_number, &bytes[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct MockStream {
        sent: Mutex<Vec<Vec<u8>>>,
        flushed: AtomicBool,
        shutdown: AtomicBool,
        receive_available: AtomicUsize,
    }

    impl MockStream {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                flushed: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                receive_available: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReliableStream for MockStream {
        async fn handle_packet(&self, bytes: &[u8]) {
            self.receive_available.fetch_add(bytes.len(), Ordering::Relaxed);
        }

        async fn send(&self, bytes: &[u8]) -> bool {
            self.sent.lock().await.push(bytes.to_vec());
            true
        }

        async fn receive_size_available(&self) -> usize {
            self.receive_available.load(Ordering::Relaxed)
        }

        async fn receive(&self, _max_len: usize) -> Vec<u8> {
            Vec::new()
        }

        async fn is_send_flushed(&self) -> bool {
            self.flushed.load(Ordering::Relaxed)
        }

        async fn is_shutdown(&self) -> bool {
            self.shutdown.load(Ordering::Relaxed)
        }

        async fn shutdown_direction(&self, _direction: ShutdownDirection) {}
    }

    fn test_channel() -> Arc<RudpChannel> {
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(MockStream::new());
        Arc::new(RudpChannel::new_internal(
            "127.0.0.1:9".parse().unwrap(),
            "lfrag".into(),
            "rfrag".into(),
            "lpass".into(),
            "rpass".into(),
            7,
            "info".into(),
            RudpChannelConfig::default(),
            stream,
            ev_tx,
            out_tx,
        ))
    }

    #[test]
    fn frame_round_trips_channel_number() {
        let framed = frame_data(42, b"payload");
        let (channel_number, payload) = parse_frame(&framed).unwrap();
        assert_eq!(channel_number, 42);
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn send_while_connecting_buffers_bytes() {
        let channel = test_channel();
        assert!(channel.send(Bytes::from_static(b"hello")).await);
        assert!(!channel.is_pending_empty().await);
    }

    #[tokio::test]
    async fn refresh_response_carries_lifetime() {
        let channel = test_channel();
        let mut request = StunMessage::new(MessageType::ChannelRefreshRequest);
        request.add_username("lfrag:rfrag");
        let response = channel.handle_refresh_request(&request);
        assert_eq!(response.header.message_type, MessageType::ChannelRefreshResponse);
        assert_eq!(response.get_lifetime().unwrap(), Some(channel.config.lifetime.as_secs() as u32));
    }

    #[tokio::test]
    async fn refresh_round_trip_via_handle_stun_response() {
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(MockStream::new());
        let channel = Arc::new(RudpChannel::new_internal(
            "127.0.0.1:9".parse().unwrap(),
            "lfrag".into(),
            "rfrag".into(),
            "lpass".into(),
            "rpass".into(),
            7,
            "info".into(),
            RudpChannelConfig::default(),
            stream,
            ev_tx,
            out_tx,
        ));
        channel.inner.lock().await.state = ChannelState::Connected;

        let driver = channel.clone();
        let handle = tokio::spawn(async move { driver.refresh_tick().await });

        let packet = out_rx.recv().await.expect("refresh request sent");
        let request = StunMessage::decode(&packet).unwrap();
        assert_eq!(request.header.message_type, MessageType::ChannelRefreshRequest);

        let mut response = request.reply(MessageType::ChannelRefreshResponse);
        response.add_lifetime(channel.config.lifetime.as_secs() as u32);
        let _ = response.add_message_integrity("lpass");
        let _ = response.add_fingerprint();

        channel.handle_stun_response(&response).await;
        handle.await.unwrap();

        // `refresh_tick` returns as soon as it spawns the requester's drive
        // task; wait for that task to clear `refresh_request` before asserting.
        for _ in 0..100 {
            if channel.inner.lock().await.refresh_request.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(channel.state().await, ChannelState::Connected);
        assert!(channel.inner.lock().await.refresh_request.is_none());
    }

    #[tokio::test]
    async fn close_request_shuts_channel_down() {
        let channel = test_channel();
        let request = StunMessage::new(MessageType::ChannelCloseRequest);
        let response = channel.handle_close_request(&request).await;
        assert_eq!(response.header.message_type, MessageType::ChannelCloseResponse);
        assert_eq!(channel.state().await, ChannelState::Shutdown);
        assert_eq!(channel.last_error().await, ErrorReason::Closed);
    }

    struct DrainingStream {
        buf: Mutex<std::collections::VecDeque<u8>>,
    }

    impl DrainingStream {
        fn new() -> Self {
            Self { buf: Mutex::new(std::collections::VecDeque::new()) }
        }
    }

    #[async_trait]
    impl ReliableStream for DrainingStream {
        async fn handle_packet(&self, bytes: &[u8]) {
            self.buf.lock().await.extend(bytes.iter().copied());
        }

        async fn send(&self, _bytes: &[u8]) -> bool {
            true
        }

        async fn receive_size_available(&self) -> usize {
            self.buf.lock().await.len()
        }

        async fn receive(&self, max_len: usize) -> Vec<u8> {
            let mut buf = self.buf.lock().await;
            let n = max_len.min(buf.len());
            buf.drain(..n).collect()
        }

        async fn is_send_flushed(&self) -> bool {
            true
        }

        async fn is_shutdown(&self) -> bool {
            false
        }

        async fn shutdown_direction(&self, _direction: ShutdownDirection) {}
    }

    #[tokio::test]
    async fn read_ready_latches_until_drained() {
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(DrainingStream::new());
        let channel = Arc::new(RudpChannel::new_internal(
            "127.0.0.1:9".parse().unwrap(),
            "lfrag".into(),
            "rfrag".into(),
            "lpass".into(),
            "rpass".into(),
            7,
            "info".into(),
            RudpChannelConfig::default(),
            stream,
            ev_tx,
            out_tx,
        ));

        channel.handle_rudp(b"first").await;
        assert!(matches!(ev_rx.recv().await, Some(ChannelEvent::ReadReady)));

        // No drain yet: a second arrival must not fire a second ReadReady.
        channel.handle_rudp(b"second").await;
        assert!(channel.receive_size_available().await > 0);

        let drained = channel.receive(usize::MAX).await;
        assert_eq!(drained, b"firstsecond");
        assert_eq!(channel.receive_size_available().await, 0);

        // Now that the stream is empty again, a fresh arrival re-arms the latch.
        channel.handle_rudp(b"third").await;
        assert!(matches!(ev_rx.recv().await, Some(ChannelEvent::ReadReady)));
        assert!(ev_rx.try_recv().is_err());
    }
}
