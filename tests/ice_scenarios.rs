//! End-to-end scenarios from spec §8, each wiring two [`IceSession`]s together
//! over the in-process [`support::pump`] bus instead of real sockets, in the
//! style of `nyx-transport/tests/integration.rs`.

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ice_rudp::ice::{Candidate, CandidateKind, IceRole, IceSession, SessionEvent, SessionState};
use ice_rudp::{ErrorReason, IceSessionConfig};
use tokio::sync::mpsc;

use support::{pump, pump_gated, wait_until};

struct Harness {
    a: Arc<IceSession>,
    b: Arc<IceSession>,
    a_addr: SocketAddr,
    b_addr: SocketAddr,
    a_events: mpsc::UnboundedReceiver<SessionEvent>,
    b_events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Clearing either stops that direction's packet delivery (spec §8 scenario 4).
    a_to_b_gate: Arc<std::sync::atomic::AtomicBool>,
    b_to_a_gate: Arc<std::sync::atomic::AtomicBool>,
}

/// Wires up `a` (role `a_role`) and `b` (role `b_role`), each with a single
/// local candidate, pumps packets between them in both directions, and drives
/// their activate/step ticks on a background loop the way
/// [`ice_rudp::scheduler::spawn_session_driver`] would in production.
fn build_pair(a_role: IceRole, b_role: IceRole, config: IceSessionConfig) -> Harness {
    let (a_ufrag, a_pass) = IceSession::generate_credentials();
    let (b_ufrag, b_pass) = IceSession::generate_credentials();

    let a_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let b_addr: SocketAddr = "127.0.0.1:40002".parse().unwrap();

    let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let a = Arc::new(IceSession::with_local_credentials(
        a_ufrag.clone(),
        a_pass.clone(),
        b_ufrag.clone(),
        b_pass.clone(),
        a_role,
        config.clone(),
        a_events_tx,
        a_out_tx,
    ));

    let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let b = Arc::new(IceSession::with_local_credentials(
        b_ufrag.clone(),
        b_pass.clone(),
        a_ufrag.clone(),
        a_pass.clone(),
        b_role,
        config,
        b_events_tx,
        b_out_tx,
    ));

    let a_to_b_gate = pump_gated(a_out_rx, a_addr, a.clone(), b.clone());
    let b_to_a_gate = pump_gated(b_out_rx, b_addr, b.clone(), a.clone());

    let drive_a = a.clone();
    let drive_b = b.clone();
    tokio::spawn(async move {
        loop {
            drive_a.activate_tick().await;
            drive_b.activate_tick().await;
            drive_a.step_tick().await;
            drive_b.step_tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    Harness {
        a,
        b,
        a_addr,
        b_addr,
        a_events: a_events_rx,
        b_events: b_events_rx,
        a_to_b_gate,
        b_to_a_gate,
    }
}

async fn add_direct_candidates(h: &Harness) {
    let (a_ufrag, a_pass) = h.a.local_credentials();
    let (a_ufrag, a_pass) = (a_ufrag.to_string(), a_pass.to_string());
    let (b_ufrag, b_pass) = h.b.local_credentials();
    let (b_ufrag, b_pass) = (b_ufrag.to_string(), b_pass.to_string());

    h.a.add_local_candidate(Candidate::new_local(h.a_addr, a_ufrag.clone(), a_pass.clone(), 65535)).await;
    h.b.add_local_candidate(Candidate::new_local(h.b_addr, b_ufrag.clone(), b_pass.clone(), 65535)).await;

    h.a.update_remote_candidates(vec![Candidate::new_local(h.b_addr, b_ufrag, b_pass, 65535)]).await;
    h.b.update_remote_candidates(vec![Candidate::new_local(h.a_addr, a_ufrag, a_pass, 65535)]).await;
}

async fn next_received_packet(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(SessionEvent::ReceivedPacket(bytes))) => return Some(bytes),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Scenario 1: happy path, symmetric direct — both reach Nominated within 2s,
/// A's nominated pair is the single (A.local, B.local), data round-trips.
#[tokio::test]
async fn happy_path_symmetric_direct() {
    let mut h = build_pair(IceRole::Controlling, IceRole::Controlled, IceSessionConfig::default());
    add_direct_candidates(&h).await;

    let both_nominated = wait_until(Duration::from_secs(2), || async {
        h.a.state().await == SessionState::Nominated && h.b.state().await == SessionState::Nominated
    })
    .await;
    assert!(both_nominated, "both sessions should reach Nominated within 2s");

    assert_eq!(h.a.nominated_remote().await, Some(h.b_addr));
    assert_eq!(h.a.nominated_local().await, Some(h.a_addr));
    assert_eq!(h.b.nominated_remote().await, Some(h.a_addr));

    assert!(h.a.send_packet(Bytes::from_static(b"hello from a")).await);
    let received = next_received_packet(&mut h.b_events, Duration::from_secs(1)).await;
    assert_eq!(received.as_deref(), Some(b"hello from a".as_slice()));
}

/// Scenario 2: role conflict — A and B both start controlling with resolvers
/// 0x1 and 0x2; exactly one flip (A -> controlled), then normal nomination.
#[tokio::test]
async fn role_conflict_resolved_by_lower_resolver_flipping() {
    let h = build_pair(IceRole::Controlling, IceRole::Controlling, IceSessionConfig::default());
    h.a.set_conflict_resolver(0x1).await;
    h.b.set_conflict_resolver(0x2).await;
    add_direct_candidates(&h).await;

    let flipped = wait_until(Duration::from_secs(2), || async { h.a.role().await == IceRole::Controlled }).await;
    assert!(flipped, "A (lower resolver) should flip to controlled");
    assert_eq!(h.b.role().await, IceRole::Controlling);

    let both_nominated = wait_until(Duration::from_secs(2), || async {
        h.a.state().await == SessionState::Nominated && h.b.state().await == SessionState::Nominated
    })
    .await;
    assert!(both_nominated, "nomination should proceed normally after the flip");
}

/// Scenario 3: peer-reflexive discovery — B's announced address differs from
/// the address A actually observes packets from (simulated NAT remap). A must
/// synthesize a PeerReflexive remote candidate and nominate on it.
#[tokio::test]
async fn peer_reflexive_candidate_is_synthesized_and_nominated() {
    let (a_ufrag, a_pass) = IceSession::generate_credentials();
    let (b_ufrag, b_pass) = IceSession::generate_credentials();

    let a_addr: SocketAddr = "127.0.0.1:40011".parse().unwrap();
    // The address B announces to A (stale, pre-NAT-remap)...
    let b_announced_addr: SocketAddr = "127.0.0.1:40012".parse().unwrap();
    // ...but packets from B actually arrive from this address.
    let b_observed_addr: SocketAddr = "127.0.0.1:40013".parse().unwrap();

    let (a_events_tx, mut a_events_rx) = mpsc::unbounded_channel();
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let a = Arc::new(IceSession::with_local_credentials(
        a_ufrag.clone(),
        a_pass.clone(),
        b_ufrag.clone(),
        b_pass.clone(),
        IceRole::Controlling,
        IceSessionConfig::default(),
        a_events_tx,
        a_out_tx,
    ));

    let (b_events_tx, _b_events_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let b = Arc::new(IceSession::with_local_credentials(
        b_ufrag.clone(),
        b_pass.clone(),
        a_ufrag.clone(),
        a_pass.clone(),
        IceRole::Controlled,
        IceSessionConfig::default(),
        b_events_tx,
        b_out_tx,
    ));

    a.add_local_candidate(Candidate::new_local(a_addr, a_ufrag.clone(), a_pass.clone(), 65535)).await;
    b.add_local_candidate(Candidate::new_local(b_observed_addr, b_ufrag.clone(), b_pass.clone(), 65535)).await;

    a.update_remote_candidates(vec![Candidate::new_local(b_announced_addr, b_ufrag.clone(), b_pass.clone(), 65535)])
        .await;
    b.update_remote_candidates(vec![Candidate::new_local(a_addr, a_ufrag.clone(), a_pass.clone(), 65535)])
        .await;

    // Pump B -> A with the *observed* source address (the NAT remap), and
    // A -> B addressed back to B's real (observed) socket.
    pump(b_out_rx, b_observed_addr, b.clone(), a.clone());
    pump(a_out_rx, a_addr, a.clone(), b.clone());

    let drive_a = a.clone();
    let drive_b = b.clone();
    tokio::spawn(async move {
        loop {
            drive_a.activate_tick().await;
            drive_b.activate_tick().await;
            drive_a.step_tick().await;
            drive_b.step_tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let nominated = wait_until(Duration::from_secs(2), || async { a.state().await == SessionState::Nominated }).await;
    assert!(nominated, "A should nominate the peer-reflexive pair");
    assert_eq!(a.nominated_remote().await, Some(b_observed_addr));
    assert!(a.pair_count().await >= 1);

    let _ = a_events_rx.try_recv();
}

/// Scenario 4: liveness loss — after nomination, all further packets are
/// dropped in both directions; with a short expect/alive-check window the
/// session must shut down with `Timeout` well within 2s of the last packet.
#[tokio::test]
async fn liveness_loss_shuts_down_with_timeout() {
    let mut config = IceSessionConfig::default();
    config.expect_stun_or_data_within = Duration::from_millis(300);
    config.alive_check_timeout = Duration::from_millis(150);

    let h = build_pair(IceRole::Controlling, IceRole::Controlled, config.clone());
    add_direct_candidates(&h).await;

    let both_nominated = wait_until(Duration::from_secs(2), || async {
        h.a.state().await == SessionState::Nominated && h.b.state().await == SessionState::Nominated
    })
    .await;
    assert!(both_nominated);

    // Simulate a dead path: drop every packet in both directions from here on.
    h.a_to_b_gate.store(false, std::sync::atomic::Ordering::SeqCst);
    h.b_to_a_gate.store(false, std::sync::atomic::Ordering::SeqCst);

    let drive_a = h.a.clone();
    tokio::spawn(async move {
        loop {
            drive_a.liveness_tick().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let shut_down = wait_until(Duration::from_secs(2), || async { h.a.state().await == SessionState::Shutdown }).await;
    assert!(shut_down, "session should shut down after liveness loss");
    assert_eq!(h.a.last_error().await, ErrorReason::Timeout);
}

/// Scenario 5: search exhaustion — no valid path exists (all checks time
/// out); with defaults the session shuts down with `CandidateSearchFailed`
/// after the 60s giveup window. Uses paused virtual time so the test runs
/// instantly instead of waiting 60 real seconds.
#[tokio::test(start_paused = true)]
async fn search_exhaustion_shuts_down_after_giveup_window() {
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let session = Arc::new(IceSession::new(
        "rfrag".into(),
        "rpass".into(),
        IceRole::Controlling,
        IceSessionConfig::default(),
        events_tx,
        out_tx,
    ));

    session
        .add_local_candidate(Candidate::new_local("127.0.0.1:45000".parse().unwrap(), "lfrag".into(), "lpass".into(), 65535))
        .await;
    // Unreachable remote: nothing ever answers these checks.
    session
        .update_remote_candidates(vec![Candidate {
            address: "127.0.0.1:45001".parse().unwrap(),
            kind: CandidateKind::Local,
            related_address: None,
            priority: Candidate::calculate_priority(CandidateKind::Local, 65535),
            username_fragment: "rfrag".into(),
            password: "rpass".into(),
            local_preference: 65535,
        }])
        .await;

    tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

    session.activate_tick().await;
    for _ in 0..40 {
        tokio::time::advance(Duration::from_secs(3)).await;
        session.step_tick().await;
    }

    assert_eq!(session.state().await, SessionState::Shutdown);
    assert_eq!(session.last_error().await, ErrorReason::CandidateSearchFailed);
}
