//! Timer/wake scheduler glue (spec §2 item 5): single-threaded-per-entity event
//! loop dispatch that turns the periodic work each [`IceSession`]/[`RudpChannel`]
//! needs (activate/step/liveness ticks, channel refresh) into `tokio::time`
//! loops, and the registry that resolves a [`SessionId`] back to a live session
//! instead of holding a strong/weak handle directly.
//!
//! Grounded in `nyx-daemon::session_manager`'s `DashMap`-backed session table
//! (`Session`/`ConnectionId`, periodic `tokio::time::interval` sweeps) and in
//! `nyx-transport::Transport::start`'s pattern of spawning one task per
//! concern (RX loop, TX loop) rather than a single monolithic loop. Spec §9's
//! "post the session id, the dispatcher resolves the id to the live session or
//! drops the event" design note is realized by looking the id up in the
//! registry on every tick instead of capturing an `Arc` in the spawned task: a
//! deregistered id silently stops being driven.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ice::IceSession;
use crate::rudp::RudpChannel;

/// Opaque identifier for a registered [`IceSession`], handed out by
/// [`IceSessionRegistry::register`]. Doubles as the "weak pointer" spec §9
/// calls for: the registry, not the id, owns the strong reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

/// Opaque identifier for a registered [`RudpChannel`], same shape as [`SessionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

/// Non-owning-by-design table of live sessions, keyed by [`SessionId`].
///
/// The socket layer (out of scope for this crate, spec §1) is expected to hold
/// `SessionId`s in its route-by-remote-IP table rather than `Arc<IceSession>`
/// directly, so that detaching a route on session cancel is just removing an
/// id from a map it already owns — no cyclic `Arc` between session and socket.
#[derive(Default)]
pub struct IceSessionRegistry {
    sessions: DashMap<SessionId, Arc<IceSession>>,
    next_id: AtomicU64,
}

impl IceSessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a session and returns the id the socket layer (or tests)
    /// should key routing/dispatch on instead of the `Arc` itself.
    pub fn register(&self, session: Arc<IceSession>) -> SessionId {
        let id = SessionId(next_id(&self.next_id));
        self.sessions.insert(id, session);
        id
    }

    /// Resolves `id` to its live session, or `None` if it was never
    /// registered or has since been deregistered (the "dropped" half of
    /// spec §9's design note).
    pub fn get(&self, id: SessionId) -> Option<Arc<IceSession>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    /// Removes `id` from the table. Called once a session reaches
    /// `Shutdown` so the socket layer's route-by-remote-IP lookups (and the
    /// driver loops below) stop finding it.
    pub fn deregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Registry of live [`RudpChannel`]s, same shape as [`IceSessionRegistry`].
#[derive(Default)]
pub struct RudpChannelRegistry {
    channels: DashMap<ChannelId, Arc<RudpChannel>>,
    next_id: AtomicU64,
}

impl RudpChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, channel: Arc<RudpChannel>) -> ChannelId {
        let id = ChannelId(next_id(&self.next_id));
        self.channels.insert(id, channel);
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<RudpChannel>> {
        self.channels.get(&id).map(|entry| entry.clone())
    }

    pub fn deregister(&self, id: ChannelId) {
        self.channels.remove(&id);
    }
}

/// Handles for the background tasks driving one session's timers. Dropping
/// this (or calling [`SessionDriverHandles::abort`]) stops all three loops;
/// letting the session reach `Shutdown` and calling
/// [`IceSessionRegistry::deregister`] is the normal, graceful path, since each
/// loop also exits on its own once `get` starts returning `None`.
pub struct SessionDriverHandles {
    activate: JoinHandle<()>,
    step: JoinHandle<()>,
    liveness: JoinHandle<()>,
}

impl SessionDriverHandles {
    pub fn abort(&self) {
        self.activate.abort();
        self.step.abort();
        self.liveness.abort();
    }
}

/// Spawns the three timer loops spec §4.2.2/§4.2.7 describe for one session:
/// the activate timer (~20 ms, one pair probed per tick), the step timer (2 s,
/// nomination/giveup), and a liveness sweep (keep-alive/expecting-data/
/// backgrounding, ticked at a finer grain than the step timer so the bounded
/// alive-check timeout stays responsive).
///
/// Each loop resolves `id` through `registry` on every tick rather than
/// capturing `session` directly, and exits as soon as that resolution fails
/// — the registry entry disappearing is the signal to stop, mirroring
/// spec §9's "resolves the id to the live session or drops the event".
pub fn spawn_session_driver(
    registry: Arc<IceSessionRegistry>,
    id: SessionId,
    activate_interval: std::time::Duration,
    step_interval: std::time::Duration,
    liveness_interval: std::time::Duration,
) -> SessionDriverHandles {
    let activate = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(activate_interval);
            loop {
                ticker.tick().await;
                let Some(session) = registry.get(id) else {
                    debug!(?id, "activate driver: session gone, stopping");
                    return;
                };
                session.activate_tick().await;
            }
        })
    };

    let step = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(step_interval);
            loop {
                ticker.tick().await;
                let Some(session) = registry.get(id) else {
                    debug!(?id, "step driver: session gone, stopping");
                    return;
                };
                session.step_tick().await;
            }
        })
    };

    let liveness = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(liveness_interval);
            loop {
                ticker.tick().await;
                let Some(session) = registry.get(id) else {
                    debug!(?id, "liveness driver: session gone, stopping");
                    return;
                };
                session.liveness_tick().await;
            }
        })
    };

    SessionDriverHandles { activate, step, liveness }
}

/// Handle for the background task refreshing one channel's lifetime.
pub struct ChannelDriverHandle(JoinHandle<()>);

impl ChannelDriverHandle {
    pub fn abort(&self) {
        self.0.abort();
    }
}

/// Spawns the refresh loop spec §4.3.2 describes: a periodic `ChannelRefresh`
/// bounded by `lifetime/2` (`RudpChannelConfig::refresh_interval`). Stops the
/// same way the session drivers do, via registry-resolution failure.
pub fn spawn_channel_driver(registry: Arc<RudpChannelRegistry>, id: ChannelId, refresh_interval: std::time::Duration) -> ChannelDriverHandle {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval);
        loop {
            ticker.tick().await;
            let Some(channel) = registry.get(id) else {
                debug!(?id, "refresh driver: channel gone, stopping");
                return;
            };
            channel.refresh_tick().await;
        }
    });
    ChannelDriverHandle(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceSessionConfig;
    use crate::ice::IceRole;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn deregistering_a_session_stops_its_drivers() {
        let registry = Arc::new(IceSessionRegistry::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let session = Arc::new(IceSession::new(
            "rfrag".into(),
            "rpass".into(),
            IceRole::Controlling,
            IceSessionConfig::default(),
            events_tx,
            out_tx,
        ));

        let id = registry.register(session);
        assert_eq!(registry.len(), 1);

        let handles = spawn_session_driver(
            registry.clone(),
            id,
            std::time::Duration::from_millis(5),
            std::time::Duration::from_millis(5),
            std::time::Duration::from_millis(5),
        );

        registry.deregister(id);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert!(handles.activate.is_finished());
        assert!(handles.step.is_finished());
        assert!(handles.liveness.is_finished());
    }
}
