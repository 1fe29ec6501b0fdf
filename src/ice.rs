//! ICE (RFC 5245) session: candidate-pair table, prioritized connectivity checks,
//! role-conflict resolution, nomination, and liveness.
//!
//! Grounded in `nyx-transport::ice`'s `IceAgent`/`Candidate`/`CandidatePair` shape
//! (`Arc<RwLock<..>>` fields, `thiserror` error enum, `calculate_pair_priority`
//! matching RFC 5245 exactly) and in `services_ICESocketSession.cpp`'s exact
//! role-conflict comparison (`conflictResolver` vs. `ICE-CONTROLLING`/
//! `ICE-CONTROLLED`) and keep-alive/backgrounding timer semantics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::IceSessionConfig;
use crate::error::ErrorReason;
use crate::stun::{ErrorCode, MessageType, StunMessage};
use crate::stun_requester::{RetryProfile, StunRequester, StunRequesterSink};

/// ICE-specific errors (distinct from the terminal [`ErrorReason`] a session ends in).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IceError {
    #[error("no valid candidate pairs")]
    NoValidCandidatePairs,
    #[error("session already shut down")]
    Closed,
    #[error("stun codec error: {0}")]
    Stun(String),
}

pub type IceResult<T> = Result<T, IceError>;

/// Kind of a candidate's transport-reachability, per RFC 5245 §4.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Local,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

/// A potential local or remote transport endpoint (spec §3 `Candidate`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: SocketAddr,
    pub kind: CandidateKind,
    pub related_address: Option<SocketAddr>,
    pub priority: u32,
    pub username_fragment: String,
    pub password: String,
    pub local_preference: u16,
}

impl Candidate {
    /// `priority` per RFC 5245 §4.1.2.1, component id fixed at 1 (single-component
    /// data channel — no RTP/RTCP split in this spec).
    pub fn calculate_priority(kind: CandidateKind, local_preference: u16) -> u32 {
        let type_preference: u32 = match kind {
            CandidateKind::Local => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        };
        (type_preference << 24) | ((local_preference as u32) << 8) | (256 - 1)
    }

    pub fn new_local(address: SocketAddr, username_fragment: String, password: String, local_preference: u16) -> Self {
        Self {
            address,
            kind: CandidateKind::Local,
            related_address: None,
            priority: Self::calculate_priority(CandidateKind::Local, local_preference),
            username_fragment,
            password,
            local_preference,
        }
    }

    /// True if `self` and `other` are redundant per spec §3 ("equal address+frag+password").
    pub fn is_redundant_with(&self, other: &Candidate) -> bool {
        self.address == other.address && self.username_fragment == other.username_fragment && self.password == other.password
    }
}

/// Current disposition of a candidate pair under evaluation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// A local×remote candidate tuple under evaluation (spec §3 `CandidatePair`).
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub state: CandidatePairState,
    pub received_request: bool,
    pub received_response: bool,
    pub failed: bool,
    pub nominated: bool,
    pub active_check: Option<Arc<StunRequester<CheckSink>>>,
}

impl std::fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidatePair")
            .field("local", &self.local.address)
            .field("remote", &self.remote.address)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("nominated", &self.nominated)
            .finish()
    }
}

/// Role in the ICE session (spec §3 `Session role`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// Pair-priority formula from spec §3, exactly RFC 5245 §5.7.2, identical to
/// `nyx-transport::ice::IceAgent::calculate_pair_priority`.
pub fn calculate_pair_priority(role: IceRole, local_priority: u32, remote_priority: u32) -> u64 {
    let (controlling, controlled) = match role {
        IceRole::Controlling => (local_priority as u64, remote_priority as u64),
        IceRole::Controlled => (remote_priority as u64, local_priority as u64),
    };
    (1u64 << 32) * controlling.min(controlled)
        + 2 * controlling.max(controlled)
        + if controlling > controlled { 1 } else { 0 }
}

/// Observable session state (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Prepared,
    Searching,
    Nominating,
    Nominated,
    Shutdown,
}

/// Events emitted to the owning application (spec §6, §9 "explicit event sink").
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    WriteReady,
    ReceivedPacket(Vec<u8>),
    ReceivedStun(Box<StunMessage>),
}

/// Sink given to each per-pair [`StunRequester`]; bridges requester callbacks back
/// into the owning session's outbound-packet plumbing. Response matching happens
/// in [`IceSession::handle_stun_response`], not here.
pub struct CheckSink {
    outbound: mpsc::UnboundedSender<(SocketAddr, bytes::Bytes)>,
}

#[async_trait::async_trait]
impl StunRequesterSink for CheckSink {
    async fn send_packet(&self, destination: SocketAddr, packet: bytes::Bytes) {
        let _ = self.outbound.send((destination, packet));
    }

    async fn on_response(&self, _response: &StunMessage) -> bool {
        // By the time IceSession::handle_stun_response calls handle_candidate_response
        // on this check, it has already matched the transaction id and verified
        // MESSAGE-INTEGRITY, so acceptance here is unconditional.
        true
    }

    async fn on_timed_out(&self) {}
}

struct LivenessState {
    last_sent_data: Option<Instant>,
    last_received_data_or_stun: Option<Instant>,
    alive_check: Option<Arc<StunRequester<CheckSink>>>,
    write_ready_latched: bool,
    search_started: Instant,
}

struct Inner {
    state: SessionState,
    role: IceRole,
    conflict_resolver: u64,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    nominated_index: Option<usize>,
}

/// The ICE session engine. One instance per peer connection.
///
/// State lives behind `tokio::sync::RwLock`s (one for the pair table, one for
/// liveness bookkeeping) rather than split across many small locks, which is the
/// Rust rendition of spec §5's "one message queue per session": every `&self`
/// method takes the lock it needs for the duration of its critical section and
/// releases it before returning, so two events never interleave their effects on
/// the same piece of state.
///
/// Cheap to clone: every field is itself an `Arc`, a sender handle, or plain
/// owned data, so a clone can be handed to a `tokio::spawn`ed task driving a
/// detached [`StunRequester`] (nomination, alive checks) without threading
/// individual fields through by hand.
#[derive(Clone)]
pub struct IceSession {
    local_ufrag: String,
    local_password: String,
    remote_ufrag: String,
    remote_password: String,
    config: IceSessionConfig,
    inner: Arc<RwLock<Inner>>,
    liveness: Arc<RwLock<LivenessState>>,
    last_error: Arc<crate::error::LastError>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::UnboundedSender<(SocketAddr, bytes::Bytes)>,
}

impl IceSession {
    /// Generates a fresh (username-fragment, password) pair, the way a local
    /// candidate-gathering step (spec §1, out of scope here) would before
    /// exchanging them with the peer out of band (SDP or similar signaling).
    /// Callers that need to know their own credentials before the remote
    /// side's are available — i.e. before they can call [`Self::new`] —
    /// generate them with this first, exchange them, then construct both
    /// sessions with [`Self::with_local_credentials`].
    pub fn generate_credentials() -> (String, String) {
        let mut ufrag_bytes = [0u8; 6];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ufrag_bytes);
        (hex::encode_bytes(&ufrag_bytes), random_password())
    }

    /// spec §4.2 `create(remoteUserFrag, remotePassword, initialRole)`, with a
    /// freshly generated local username fragment and password.
    pub fn new(
        remote_ufrag: String,
        remote_password: String,
        initial_role: IceRole,
        config: IceSessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        outbound: mpsc::UnboundedSender<(SocketAddr, bytes::Bytes)>,
    ) -> Self {
        let (local_ufrag, local_password) = Self::generate_credentials();
        Self::with_local_credentials(local_ufrag, local_password, remote_ufrag, remote_password, initial_role, config, events, outbound)
    }

    /// Same contract as [`Self::new`], but with caller-supplied local
    /// credentials instead of freshly generated ones — needed when the local
    /// ufrag/password must be known and exchanged with the peer before the
    /// session carrying the peer's own credentials can be constructed.
    #[allow(clippy::too_many_arguments)]
    pub fn with_local_credentials(
        local_ufrag: String,
        local_password: String,
        remote_ufrag: String,
        remote_password: String,
        initial_role: IceRole,
        config: IceSessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        outbound: mpsc::UnboundedSender<(SocketAddr, bytes::Bytes)>,
    ) -> Self {
        Self {
            local_ufrag,
            local_password,
            remote_ufrag,
            remote_password,
            config,
            inner: Arc::new(RwLock::new(Inner {
                state: SessionState::Pending,
                role: initial_role,
                conflict_resolver: rand::random(),
                local_candidates: Vec::new(),
                remote_candidates: Vec::new(),
                pairs: Vec::new(),
                nominated_index: None,
            })),
            liveness: Arc::new(RwLock::new(LivenessState {
                last_sent_data: None,
                last_received_data_or_stun: None,
                alive_check: None,
                write_ready_latched: false,
                search_started: Instant::now(),
            })),
            last_error: Arc::new(crate::error::LastError::new()),
            events,
            outbound,
        }
    }

    /// Adds a local candidate gathered externally (candidate gathering is out of
    /// scope for this crate, spec §1).
    pub async fn add_local_candidate(&self, candidate: Candidate) {
        let mut inner = self.inner.write().await;
        inner.local_candidates.push(candidate);
        if inner.state == SessionState::Pending {
            inner.state = SessionState::Prepared;
        }
    }

    /// spec §4.2 `updateRemoteCandidates(list)` — replaces the remote set and
    /// rebuilds the pair table (§4.2.1).
    #[instrument(skip(self, candidates))]
    pub async fn update_remote_candidates(&self, candidates: Vec<Candidate>) {
        let mut inner = self.inner.write().await;
        inner.remote_candidates = candidates;
        self.rebuild_pairs_locked(&mut inner);
        if inner.state == SessionState::Prepared {
            inner.state = SessionState::Searching;
        }
        drop(inner);
        self.emit_state_change().await;
    }

    /// §4.2.1 pair construction: Cartesian product, role-correct priority sort,
    /// then prune per the rules the spec lists.
    fn rebuild_pairs_locked(&self, inner: &mut Inner) {
        // "any in-flight probes from the old table are canceled before the
        // new table is used" (spec §5) — detach and cancel before replacing.
        for pair in &mut inner.pairs {
            if let Some(check) = pair.active_check.take() {
                tokio::spawn(async move { check.cancel().await });
            }
        }

        let mut pairs = Vec::new();
        for local in &inner.local_candidates {
            if local.kind == CandidateKind::ServerReflexive {
                // "drop pairs whose local is ServerReflexive" (spec §4.2.1).
                continue;
            }
            for remote in &inner.remote_candidates {
                let priority = calculate_pair_priority(inner.role, local.priority, remote.priority);
                pairs.push(CandidatePair {
                    local: local.clone(),
                    remote: remote.clone(),
                    priority,
                    state: CandidatePairState::Waiting,
                    received_request: false,
                    received_response: false,
                    failed: false,
                    nominated: false,
                    active_check: None,
                });
            }
        }

        pairs.sort_by(|a, b| b.priority.cmp(&a.priority));

        // "drop a pair if an earlier (higher-priority) pair already uses an
        // equivalent remote ... at the same local-kind layer" (spec §4.2.1).
        let mut seen: Vec<(SocketAddr, String, String, CandidateKind)> = Vec::new();
        pairs.retain(|pair| {
            let key = (
                pair.remote.address,
                pair.remote.username_fragment.clone(),
                pair.remote.password.clone(),
                pair.local.kind,
            );
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });

        pairs.truncate(self.config.max_candidate_pairs);
        inner.nominated_index = None;
        inner.pairs = pairs;
    }

    /// spec §4.2 `handlePacket` — data-plane delivery, valid only while nominated
    /// and matching the nominated pair's remote address.
    pub async fn handle_packet(&self, source: SocketAddr, bytes: Vec<u8>) -> bool {
        let nominated_addr = {
            let inner = self.inner.read().await;
            match inner.nominated_index {
                Some(idx) => inner.pairs.get(idx).map(|p| p.remote.address),
                None => None,
            }
        };

        if nominated_addr != Some(source) {
            return false;
        }

        {
            let mut liveness = self.liveness.write().await;
            liveness.last_received_data_or_stun = Some(Instant::now());
            if let Some(check) = liveness.alive_check.take() {
                tokio::spawn(async move { check.cancel().await });
            }
        }

        let _ = self.events.send(SessionEvent::ReceivedPacket(bytes));
        true
    }

    /// Records that a STUN request/response addressed to this session just
    /// arrived, satisfying spec §4.2.7's "no data *or STUN* has been
    /// received" liveness condition and dropping any outstanding alive check,
    /// the same bookkeeping [`Self::handle_packet`] does for data-plane bytes.
    async fn note_stun_activity(&self) {
        let mut liveness = self.liveness.write().await;
        liveness.last_received_data_or_stun = Some(Instant::now());
        if let Some(check) = liveness.alive_check.take() {
            tokio::spawn(async move { check.cancel().await });
        }
    }

    /// spec §4.2 `sendPacket(bytes)` — valid only while nominated.
    pub async fn send_packet(&self, bytes: bytes::Bytes) -> bool {
        let nominated_addr = {
            let inner = self.inner.read().await;
            match inner.nominated_index {
                Some(idx) => inner.pairs.get(idx).map(|p| p.remote.address),
                None => None,
            }
        };

        let Some(addr) = nominated_addr else { return false };
        let _ = self.outbound.send((addr, bytes));

        let mut liveness = self.liveness.write().await;
        liveness.last_sent_data = Some(Instant::now());
        // "consuming the edge" (spec §5 write-ready edge-triggering).
        liveness.write_ready_latched = false;
        true
    }

    /// spec §4.2 `handleSTUNPacket` — the unified entry point the socket layer
    /// dispatches every classified-as-STUN datagram through. Routes to
    /// request handling (§4.2.3), response handling (§4.2.4), or keep-alive
    /// indication handling (§4.2.7) by message type, returning a reply to
    /// serialize and send back to `source` when one is needed.
    pub async fn handle_stun_packet(&self, source: SocketAddr, packet: &StunMessage) -> Option<StunMessage> {
        if packet.header.message_type.is_request() {
            self.handle_stun_request(source, packet).await
        } else if packet.header.message_type == MessageType::BindingIndication {
            self.handle_stun_indication(packet).await;
            None
        } else {
            self.handle_stun_response(packet).await;
            None
        }
    }

    /// spec §4.2.7: an inbound keep-alive indication counts as liveness
    /// activity just like data or a request/response does, but carries no
    /// reply and never mutates the pair table.
    async fn handle_stun_indication(&self, indication: &StunMessage) {
        if let Some(username) = indication.get_username() {
            // USERNAME = remoteFrag:localFrag from the *sender's* point of view
            // (spec §4.2.2), so the first segment is this session's own ufrag.
            let Some((addressed_to, _sender_frag)) = username.split_once(':') else {
                return;
            };
            if addressed_to != self.local_ufrag {
                return;
            }
        }
        self.note_stun_activity().await;
    }

    /// spec §4.2.3 inbound STUN *request* handling.
    #[instrument(skip(self, request))]
    pub async fn handle_stun_request(&self, source: SocketAddr, request: &StunMessage) -> Option<StunMessage> {
        let Some(username) = request.get_username() else {
            return None;
        };
        // USERNAME = remoteFrag:localFrag from the *sender's* point of view (spec
        // §4.2.2): the first segment is this session's own ufrag as the sender
        // sees it, the second is the sender's own ufrag (used below as `remote_frag`
        // to locate/synthesize the pair).
        let Some((addressed_to, remote_frag)) = username.split_once(':') else {
            return None;
        };
        if addressed_to != self.local_ufrag {
            return None;
        }

        self.note_stun_activity().await;

        if !matches!(request.verify_message_integrity(&self.local_password), Ok(true)) {
            let mut response = request.reply(MessageType::BindingErrorResponse);
            response.add_error_code(ErrorCode::Unauthorized);
            return Some(response);
        }

        let mut inner = self.inner.write().await;

        let pair_index = match self.find_or_synthesize_pair_locked(&mut inner, source, remote_frag) {
            Some(idx) => idx,
            None => return None,
        };

        // Role-conflict detection (spec §4.2.3 step 3 / §3, exact comparison
        // grounded in `services_ICESocketSession.cpp`'s `wonConflict` logic).
        if let Some(remote_controlling) = request.get_ice_controlling().ok().flatten() {
            if inner.role == IceRole::Controlling {
                let won = inner.conflict_resolver >= remote_controlling;
                if !won {
                    self.flip_role_locked(&mut inner);
                } else {
                    let mut response = request.reply(MessageType::BindingErrorResponse);
                    response.add_error_code(ErrorCode::RoleConflict);
                    return Some(response);
                }
            }
        }
        if let Some(remote_controlled) = request.get_ice_controlled().ok().flatten() {
            if inner.role == IceRole::Controlled {
                let won = inner.conflict_resolver < remote_controlled;
                if won {
                    self.flip_role_locked(&mut inner);
                } else {
                    let mut response = request.reply(MessageType::BindingErrorResponse);
                    response.add_error_code(ErrorCode::RoleConflict);
                    return Some(response);
                }
            }
        }

        let use_candidate = request.has_use_candidate();
        let local_password = self.local_password.clone();

        {
            let pair = &mut inner.pairs[pair_index];
            pair.received_request = true;
        }
        let outstanding = inner.pairs[pair_index].active_check.clone();

        if use_candidate && inner.role == IceRole::Controlled {
            inner.pairs[pair_index].nominated = true;
            inner.nominated_index = Some(pair_index);
            inner.state = SessionState::Nominated;
            let mut liveness = self.liveness.write().await;
            liveness.write_ready_latched = false;
            drop(liveness);
        }

        drop(inner);

        if let Some(check) = outstanding {
            check.retry_request_now().await;
        }

        self.emit_state_change().await;

        let mut response = request.reply(MessageType::BindingResponse);
        response.add_xor_mapped_address(source);
        let _ = response.add_message_integrity(&local_password);
        Some(response)
    }

    /// Finds the pair matching `(source, remote_frag)`, or synthesizes a
    /// peer-reflexive candidate + pair per spec §4.2.3 step 2.
    fn find_or_synthesize_pair_locked(&self, inner: &mut Inner, source: SocketAddr, remote_frag: &str) -> Option<usize> {
        if let Some(idx) = inner.pairs.iter().position(|p| p.remote.address == source && p.remote.username_fragment == remote_frag) {
            return Some(idx);
        }

        if inner.pairs.len() >= self.config.max_candidate_pairs {
            warn!("peer-reflexive discovery dropped: candidate-pair table full");
            return None;
        }

        // Pick any existing local candidate to pair against (component 1, single layer).
        let local = inner.local_candidates.first()?.clone();
        let priority = Candidate::calculate_priority(CandidateKind::PeerReflexive, 0);
        let remote = Candidate {
            address: source,
            kind: CandidateKind::PeerReflexive,
            related_address: None,
            priority,
            username_fragment: remote_frag.to_string(),
            password: self.remote_password.clone(),
            local_preference: 0,
        };

        inner.remote_candidates.push(remote.clone());
        let pair_priority = calculate_pair_priority(inner.role, local.priority, remote.priority);
        inner.pairs.push(CandidatePair {
            local,
            remote,
            priority: pair_priority,
            state: CandidatePairState::Waiting,
            received_request: false,
            received_response: false,
            failed: false,
            nominated: false,
            active_check: None,
        });
        info!("synthesized peer-reflexive candidate from {source}");
        Some(inner.pairs.len() - 1)
    }

    fn flip_role_locked(&self, inner: &mut Inner) {
        inner.role = match inner.role {
            IceRole::Controlling => IceRole::Controlled,
            IceRole::Controlled => IceRole::Controlling,
        };
        // "switchRole triggers updateRemoteCandidates ... rebuilds pairs even when
        // the new list is value-equal" (spec §9 open question) — we always rebuild
        // unconditionally here, so no identity check is needed.
        self.rebuild_pairs_locked(inner);
        info!(new_role = ?inner.role, "ICE role flipped due to conflict");
    }

    /// spec §4.2.4 inbound STUN *response* handling, keyed by the pair whose
    /// active check's transaction id matches.
    pub async fn handle_stun_response(&self, response: &StunMessage) {
        // Any inbound STUN response counts as activity and drops a pending
        // alive check (spec §4.2.7), even one that matches no pair's
        // `active_check` — e.g. the alive check's own response, which lives
        // in `liveness.alive_check` rather than a pair.
        self.note_stun_activity().await;

        let check = {
            let inner = self.inner.read().await;
            inner
                .pairs
                .iter()
                .find_map(|p| p.active_check.clone().filter(|c| c.transaction_id() == response.header.transaction_id))
        };
        let Some(check) = check else { return };

        if response.header.message_type.is_error() {
            if let Ok(Some(ErrorCode::RoleConflict)) = response.get_error_code() {
                // "flip role based on which of ICE-CONTROLLING/ICE-CONTROLLED was
                // present in the original request" (spec §4.2.4) — and only if
                // that role still holds, so a request-handling flip (§4.2.3
                // step 3) for the same conflict can't double-flip us back.
                let asserted_controlling = check.request().get_ice_controlling().ok().flatten().is_some();
                let mut inner = self.inner.write().await;
                let still_applies = if asserted_controlling {
                    inner.role == IceRole::Controlling
                } else {
                    inner.role == IceRole::Controlled
                };
                if still_applies {
                    self.flip_role_locked(&mut inner);
                }
            }
            return;
        }

        if !matches!(response.verify_message_integrity(&self.remote_password), Ok(true)) {
            return;
        }

        let accepted = check.handle_candidate_response(response).await;
        if !accepted {
            return;
        }

        let mut inner = self.inner.write().await;
        if let Some(pair) = inner
            .pairs
            .iter_mut()
            .find(|p| p.active_check.as_ref().map(|c| c.transaction_id()) == Some(response.header.transaction_id))
        {
            pair.received_response = true;
            pair.failed = false;
            pair.state = CandidatePairState::Succeeded;
            pair.active_check = None;
        }
    }

    /// spec §4.2.2 activate-timer tick: issue one Binding request on the
    /// highest-priority eligible pair.
    #[instrument(skip(self))]
    pub async fn activate_tick(&self) {
        let role;
        let conflict_resolver;
        let local_password_peer;
        let mut picked: Option<usize> = None;
        {
            let inner = self.inner.read().await;
            role = inner.role;
            conflict_resolver = inner.conflict_resolver;
            local_password_peer = self.remote_password.clone();
            for (idx, pair) in inner.pairs.iter().enumerate() {
                if pair.active_check.is_none() && !pair.received_response && !pair.failed {
                    picked = Some(idx);
                    break;
                }
            }
        }

        let Some(idx) = picked else { return };

        let mut inner = self.inner.write().await;
        let Some(pair) = inner.pairs.get_mut(idx) else { return };

        let mut request = StunMessage::new(MessageType::BindingRequest);
        request.add_username(&format!("{}:{}", self.remote_ufrag, self.local_ufrag));
        request.add_priority(pair.local.priority);
        match role {
            IceRole::Controlling => request.add_ice_controlling(conflict_resolver),
            IceRole::Controlled => request.add_ice_controlled(conflict_resolver),
        }
        let _ = request.add_message_integrity(&local_password_peer);

        let packet = match request.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode connectivity check");
                return;
            }
        };

        let destination = pair.remote.address;
        let sink = CheckSink {
            outbound: self.outbound.clone(),
        };
        let requester = Arc::new(StunRequester::create(destination, request, packet, RetryProfile::rfc5389_default(), sink));
        let transaction_id = requester.transaction_id();
        pair.state = CandidatePairState::InProgress;
        pair.active_check = Some(requester.clone());

        // Apply the terminal outcome back onto the owning pair once the
        // transaction concludes, so spec §4.2.4's "on timeout: mark failed,
        // drop the requester" holds even though the check itself runs
        // detached from this tick. A `Succeeded` outcome is a no-op here:
        // `handle_stun_response` already updated the pair by the time
        // `on_response` told the requester to stop waiting.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if requester.run().await == Some(crate::stun_requester::TransactionOutcome::TimedOut) {
                let mut inner = inner.write().await;
                if let Some(pair) = inner.pairs.iter_mut().find(|p| p.active_check.as_ref().map(|c| c.transaction_id()) == Some(transaction_id)) {
                    pair.failed = true;
                    pair.state = CandidatePairState::Failed;
                    pair.active_check = None;
                }
            }
        });
    }

    /// spec §4.2.5 step-timer nomination/giveup logic (controlling role only;
    /// controlled role observes nomination per §4.2.6/§4.2.3 step 6).
    #[instrument(skip(self))]
    pub async fn step_tick(&self) {
        let role = self.inner.read().await.role;
        if role != IceRole::Controlling {
            self.check_giveup().await;
            return;
        }

        let search_started = self.liveness.read().await.search_started;
        let searching_for = search_started.elapsed();

        let best_valid = {
            let inner = self.inner.read().await;
            inner
                .pairs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.received_request && p.received_response && !p.failed)
                .max_by_key(|(_, p)| p.priority)
                .map(|(idx, p)| (idx, p.priority))
        };

        let Some((idx, priority)) = best_valid else {
            self.check_giveup().await;
            return;
        };

        let is_top = {
            let inner = self.inner.read().await;
            inner.pairs.iter().all(|p| p.priority <= priority)
        };

        let should_nominate = is_top || searching_for >= self.config.search_giveup_ideal_window;
        if should_nominate {
            self.nominate(idx).await;
        } else {
            self.check_giveup().await;
        }
    }

    async fn check_giveup(&self) {
        let search_started = self.liveness.read().await.search_started;
        if search_started.elapsed() < self.config.max_wait_for_activation_when_all_done {
            return;
        }

        let has_work_or_valid = {
            let inner = self.inner.read().await;
            inner.nominated_index.is_some()
                || inner.pairs.iter().any(|p| p.active_check.is_some() || (p.received_request && p.received_response && !p.failed))
        };

        if !has_work_or_valid {
            self.shutdown_with(ErrorReason::CandidateSearchFailed).await;
        }
    }

    async fn nominate(&self, idx: usize) {
        let (destination, local_priority, local_password_peer, conflict_resolver, ufrag_pair);
        {
            let inner = self.inner.read().await;
            let Some(pair) = inner.pairs.get(idx) else { return };
            destination = pair.remote.address;
            local_priority = pair.local.priority;
            local_password_peer = self.remote_password.clone();
            conflict_resolver = inner.conflict_resolver;
            ufrag_pair = format!("{}:{}", self.remote_ufrag, self.local_ufrag);
        }

        {
            let mut inner = self.inner.write().await;
            inner.state = SessionState::Nominating;
        }
        self.emit_state_change().await;

        let mut request = StunMessage::new(MessageType::BindingRequest);
        request.add_username(&ufrag_pair);
        request.add_priority(local_priority);
        request.add_ice_controlling(conflict_resolver);
        request.add_use_candidate();
        let _ = request.add_message_integrity(&local_password_peer);

        let Ok(packet) = request.encode() else { return };
        let sink = CheckSink {
            outbound: self.outbound.clone(),
        };
        let requester = Arc::new(StunRequester::create(destination, request, packet, RetryProfile::rfc5389_default(), sink));

        {
            let mut inner = self.inner.write().await;
            if let Some(pair) = inner.pairs.get_mut(idx) {
                pair.active_check = Some(requester.clone());
            }
            inner.nominated_index = Some(idx);
        }

        // Drive the transaction off the scheduler's tick: the full retry
        // schedule can run up to ~60s, and `step_tick` must stay responsive.
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = requester.run().await;
            if outcome == Some(crate::stun_requester::TransactionOutcome::Succeeded) {
                let mut inner = this.inner.write().await;
                if let Some(pair) = inner.pairs.get_mut(idx) {
                    pair.nominated = true;
                }
                inner.state = SessionState::Nominated;
                drop(inner);
                this.arm_write_ready().await;
                this.emit_state_change().await;
            }
        });
    }

    async fn arm_write_ready(&self) {
        let mut liveness = self.liveness.write().await;
        if !liveness.write_ready_latched {
            liveness.write_ready_latched = true;
            let _ = self.events.send(SessionEvent::WriteReady);
        }
    }

    /// spec §4.2.7 liveness timers; called periodically by the scheduler.
    pub async fn liveness_tick(&self) {
        let nominated = self.inner.read().await.nominated_index.is_some();
        if !nominated {
            return;
        }

        let (last_sent, last_activity) = {
            let liveness = self.liveness.read().await;
            (liveness.last_sent_data, liveness.last_received_data_or_stun)
        };

        if self.config.keep_alive_interval > Duration::ZERO {
            let due = last_sent.map(|t| t.elapsed() >= self.config.keep_alive_interval).unwrap_or(true);
            if due {
                self.send_keep_alive_indication().await;
            }
        }

        if self.config.expect_stun_or_data_within > Duration::ZERO {
            let stale = last_activity.map(|t| t.elapsed() >= self.config.expect_stun_or_data_within).unwrap_or(true);
            let already_checking = self.liveness.read().await.alive_check.is_some();
            if stale && !already_checking {
                self.issue_alive_check().await;
            }
        }

        if self.config.backgrounding_timeout > Duration::ZERO {
            let idle = last_activity.map(|t| t.elapsed() >= self.config.backgrounding_timeout).unwrap_or(true);
            if idle {
                self.shutdown_with(ErrorReason::BackgroundingTimeout).await;
            }
        }
    }

    async fn send_keep_alive_indication(&self) {
        let destination = {
            let inner = self.inner.read().await;
            inner.nominated_index.and_then(|idx| inner.pairs.get(idx)).map(|p| p.remote.address)
        };
        let Some(destination) = destination else { return };

        let mut indication = StunMessage::new(MessageType::BindingIndication);
        if !self.remote_ufrag.is_empty() {
            indication.add_username(&format!("{}:{}", self.remote_ufrag, self.local_ufrag));
            let _ = indication.add_message_integrity(&self.remote_password);
        }
        if let Ok(packet) = indication.encode() {
            let _ = self.outbound.send((destination, packet));
            self.liveness.write().await.last_sent_data = Some(Instant::now());
        }
    }

    async fn issue_alive_check(&self) {
        let destination = {
            let inner = self.inner.read().await;
            inner.nominated_index.and_then(|idx| inner.pairs.get(idx)).map(|p| p.remote.address)
        };
        let Some(destination) = destination else { return };

        let mut request = StunMessage::new(MessageType::BindingRequest);
        request.add_username(&format!("{}:{}", self.remote_ufrag, self.local_ufrag));
        let _ = request.add_message_integrity(&self.remote_password);
        let Ok(packet) = request.encode() else { return };

        let sink = CheckSink {
            outbound: self.outbound.clone(),
        };
        let requester = Arc::new(StunRequester::create(
            destination,
            request,
            packet,
            RetryProfile::bounded(self.config.alive_check_timeout),
            sink,
        ));
        self.liveness.write().await.alive_check = Some(requester.clone());

        // Drive off the liveness tick rather than blocking it: `bounded`
        // still spans `alive_check_timeout`, which would otherwise stall
        // every other liveness check this session runs meanwhile.
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = requester.run().await;
            if outcome == Some(crate::stun_requester::TransactionOutcome::TimedOut) {
                this.shutdown_with(ErrorReason::Timeout).await;
            }
        });
    }

    async fn emit_state_change(&self) {
        let state = self.inner.read().await.state;
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    /// spec §4.2 `close()` — idempotent (spec §8 "Shutdown idempotence").
    pub async fn close(&self) {
        self.shutdown_with(ErrorReason::Closed).await;
    }

    async fn shutdown_with(&self, reason: ErrorReason) {
        let already = self.last_error.is_set();
        self.last_error.set(reason);
        if already {
            return;
        }

        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Shutdown {
            return;
        }
        for pair in &mut inner.pairs {
            if let Some(check) = pair.active_check.take() {
                tokio::spawn(async move { check.cancel().await });
            }
        }
        inner.state = SessionState::Shutdown;
        drop(inner);

        let mut liveness = self.liveness.write().await;
        if let Some(check) = liveness.alive_check.take() {
            tokio::spawn(async move { check.cancel().await });
        }
        drop(liveness);

        debug!(?reason, "ICE session shut down");
        self.emit_state_change().await;
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    pub async fn role(&self) -> IceRole {
        self.inner.read().await.role
    }

    /// The nominated pair's remote address, if any — what the socket layer
    /// (spec §1, out of scope here) would register its route against.
    pub async fn nominated_remote(&self) -> Option<SocketAddr> {
        let inner = self.inner.read().await;
        inner.nominated_index.and_then(|idx| inner.pairs.get(idx)).map(|p| p.remote.address)
    }

    /// The nominated pair's local address, if any.
    pub async fn nominated_local(&self) -> Option<SocketAddr> {
        let inner = self.inner.read().await;
        inner.nominated_index.and_then(|idx| inner.pairs.get(idx)).map(|p| p.local.address)
    }

    /// Overrides the randomly generated `conflictResolver` (spec §3) chosen at
    /// construction. Exposed for deterministic interop tests of role-conflict
    /// resolution (spec §8 scenario 2); production callers should rely on the
    /// random value `new`/`with_local_credentials` already picked.
    pub async fn set_conflict_resolver(&self, value: u64) {
        self.inner.write().await.conflict_resolver = value;
    }

    pub async fn pair_count(&self) -> usize {
        self.inner.read().await.pairs.len()
    }

    pub async fn last_error(&self) -> ErrorReason {
        self.last_error.get()
    }

    pub fn local_credentials(&self) -> (&str, &str) {
        (&self.local_ufrag, &self.local_password)
    }
}

fn random_password() -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    hex::encode_bytes(&bytes)
}

/// Tiny hex-encoding helper so the crate doesn't need a dedicated `hex` dependency
/// just for username-fragment/password generation.
mod hex {
    pub fn encode_bytes(bytes: &[u8]) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(out, "{b:02x}");
        }
        out
    }
}
