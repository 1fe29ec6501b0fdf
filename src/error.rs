//! Crate-wide error reason shared by the session and channel state machines.

use thiserror::Error;

/// The terminal reason a session or channel reached `Shutdown`.
///
/// Mirrors the `ErrorCode` set surfaced to the application (spec §6). `mLastError`
/// in the original implementation is sticky — first cause wins — which is why
/// [`LastError`] exposes `set` as a no-op once occupied rather than a plain setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorReason {
    /// No error has occurred; only ever observed before any shutdown.
    #[error("none")]
    None,
    /// Closed by the local application.
    #[error("closed")]
    Closed,
    /// A bounded wait (keep-alive, refresh, alive-check) elapsed with no response.
    #[error("timeout")]
    Timeout,
    /// No activity observed for `backgroundingTimeout`.
    #[error("backgrounding timeout")]
    BackgroundingTimeout,
    /// No valid candidate pair emerged within `maxWaitForActivationWhenAllDone`.
    #[error("candidate search failed")]
    CandidateSearchFailed,
    /// The owning delegate/event sink has disappeared.
    #[error("delegate gone")]
    DelegateGone,
    /// The underlying socket abstraction has disappeared.
    #[error("socket gone")]
    SocketGone,
}

impl Default for ErrorReason {
    fn default() -> Self {
        ErrorReason::None
    }
}

/// Sticky first-cause-wins holder for [`ErrorReason`].
///
/// Grounded in `once_cell::sync::OnceCell`'s "first write wins, no lock needed"
/// semantics (`nyx-core` already depends on `once_cell`); `set` silently keeps
/// the existing value instead of erroring, since callers race to report the
/// same shutdown from several code paths.
#[derive(Debug, Default)]
pub struct LastError(once_cell::sync::OnceCell<ErrorReason>);

impl LastError {
    /// Creates an unset holder.
    pub fn new() -> Self {
        Self(once_cell::sync::OnceCell::new())
    }

    /// Records `reason` if no reason has been recorded yet. Returns the reason
    /// that ends up stored (the first one ever set).
    pub fn set(&self, reason: ErrorReason) -> ErrorReason {
        *self.0.get_or_init(|| reason)
    }

    /// Returns the recorded reason, or `None` if nothing has been set.
    pub fn get(&self) -> ErrorReason {
        self.0.get().copied().unwrap_or(ErrorReason::None)
    }

    /// True once any reason besides `None` has been recorded.
    pub fn is_set(&self) -> bool {
        self.0.get().is_some()
    }
}
