//! STUN requester: drives one request/response transaction to completion with
//! RFC 5389 §7.2.1 retransmission (geometric RTO backoff), or a bounded override
//! for the ICE alive-check case (spec §4.1).
//!
//! Modeled as the explicit state machine spec §9 calls for
//! (`Idle → Sending → Awaiting → {Succeeded, Failed}`), the way
//! `nyx-transport`'s STUN/TURN clients drive a `tokio::time::timeout`-guarded
//! exchange, but reified as a standalone type so both the ICE session and the
//! RUDP channel can own many concurrent transactions without an owned socket.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::stun::StunMessage;

/// Default initial retransmission timeout (RFC 5389 §7.2.1).
pub const DEFAULT_RTO: Duration = Duration::from_millis(500);
/// Default retransmission count before giving up.
pub const DEFAULT_RC: u32 = 7;
/// Default final-timeout multiplier applied to the last RTO (RFC 5389 §7.2.1).
pub const DEFAULT_RM: u32 = 16;

/// Governs retransmission timing for one transaction.
#[derive(Debug, Clone, Copy)]
pub struct RetryProfile {
    pub initial_rto: Duration,
    pub retransmissions: u32,
    pub final_timeout_multiplier: u32,
}

impl RetryProfile {
    /// RFC 5389 §7.2.1 default schedule.
    pub fn rfc5389_default() -> Self {
        Self {
            initial_rto: DEFAULT_RTO,
            retransmissions: DEFAULT_RC,
            final_timeout_multiplier: DEFAULT_RM,
        }
    }

    /// A bounded profile for the ICE "alive check" case (spec §4.2.7): a handful
    /// of fast retries capped by an overall `timeout`.
    pub fn bounded(timeout: Duration) -> Self {
        let retransmissions = 3;
        let initial_rto = timeout / (retransmissions + 1);
        Self {
            initial_rto: initial_rto.max(Duration::from_millis(20)),
            retransmissions,
            final_timeout_multiplier: 1,
        }
    }

    /// Returns the wait *after* each send: `sends()` sends happen, each followed
    /// by one entry of this schedule; the last entry is the final timeout wait
    /// (no send follows it).
    fn wait_after_send(&self) -> Vec<Duration> {
        let mut out = Vec::with_capacity(self.retransmissions as usize + 1);
        let mut rto = self.initial_rto;
        for _ in 0..self.retransmissions {
            out.push(rto);
            rto *= 2;
        }
        out.push(self.initial_rto * self.final_timeout_multiplier.max(1));
        out
    }

    fn sends(&self) -> usize {
        self.retransmissions as usize + 1
    }
}

/// Outcome delivered to the owner when a transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The owner's `on_response` callback accepted a response.
    Succeeded,
    /// No accepted response arrived before the retry schedule was exhausted.
    TimedOut,
}

/// Callbacks a `StunRequester` invokes on its owner.
///
/// Mirrors `ISTUNRequesterDelegate` in the original (`services_RUDPChannel.h`):
/// "send this packet", "response received" (bool = accept and end transaction),
/// "timed out" — expressed here as async trait methods instead of virtual calls.
#[async_trait]
pub trait StunRequesterSink: Send + Sync {
    /// Deliver a serialized packet to `destination`. Errors are logged, not fatal
    /// to the transaction (a send failure is just a lost retransmission).
    async fn send_packet(&self, destination: SocketAddr, packet: Bytes);

    /// A candidate response arrived. Return `true` to accept it and end the
    /// transaction, `false` to keep waiting (e.g. transaction id matched but
    /// integrity failed).
    async fn on_response(&self, response: &StunMessage) -> bool;

    /// The transaction exhausted its retry schedule with no accepted response.
    async fn on_timed_out(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sending,
    Awaiting,
    Done,
}

struct Inner {
    state: State,
    /// Set alongside `state = Done`, so `run()` can report *which* terminal
    /// condition ended the transaction instead of just that it ended.
    outcome: Option<TransactionOutcome>,
}

/// Drives one outstanding STUN transaction. See module docs.
pub struct StunRequester<S: StunRequesterSink> {
    destination: SocketAddr,
    request: StunMessage,
    packet: Bytes,
    wait_after_send: Vec<Duration>,
    total_sends: usize,
    sink: S,
    inner: Mutex<Inner>,
    /// Signaled by [`Self::retry_request_now`] to collapse the current wait to zero.
    retry_now: Notify,
}

impl<S: StunRequesterSink> StunRequester<S> {
    /// Creates a requester; the caller drives it with [`Self::run`], typically
    /// via `tokio::spawn`.
    pub fn create(destination: SocketAddr, request: StunMessage, packet: Bytes, profile: RetryProfile, sink: S) -> Self {
        Self {
            destination,
            request,
            packet,
            wait_after_send: profile.wait_after_send(),
            total_sends: profile.sends(),
            sink,
            inner: Mutex::new(Inner {
                state: State::Sending,
                outcome: None,
            }),
            retry_now: Notify::new(),
        }
    }

    /// The transaction id this requester is waiting on.
    pub fn transaction_id(&self) -> [u8; 12] {
        self.request.header.transaction_id
    }

    /// The original outbound request, e.g. to recover which role attribute it
    /// asserted when a `487 Role Conflict` response arrives (spec §4.2.4).
    pub fn request(&self) -> &StunMessage {
        &self.request
    }

    /// Drives the transaction to completion: sends, waits the schedule's entry
    /// (or until [`Self::retry_request_now`] collapses it), resends until
    /// `total_sends` is reached, then reports `TimedOut`. Returns the terminal
    /// outcome recorded in `Inner` once the transaction reaches `Done` — whether
    /// that happened here (exhausted schedule), via
    /// [`Self::handle_candidate_response`] (accepted), or via [`Self::cancel`]
    /// (`None`) — rather than assuming `Done` always means this call's own path.
    pub async fn run(&self) -> Option<TransactionOutcome> {
        for send_index in 0..self.total_sends {
            {
                let mut inner = self.inner.lock().await;
                if inner.state == State::Done {
                    return inner.outcome;
                }
                inner.state = State::Sending;
            }

            self.sink.send_packet(self.destination, self.packet.clone()).await;
            trace!(send_index, "stun requester: sent");

            {
                let mut inner = self.inner.lock().await;
                inner.state = State::Awaiting;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(Instant::now() + self.wait_after_send[send_index]) => {}
                _ = self.retry_now.notified() => {
                    debug!(send_index, "stun requester: retry_request_now collapsed wait");
                }
            }

            let inner = self.inner.lock().await;
            if inner.state == State::Done {
                return inner.outcome;
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.state == State::Done {
                return inner.outcome;
            }
            inner.state = State::Done;
            inner.outcome = Some(TransactionOutcome::TimedOut);
        }
        warn!("stun requester: exhausted retry schedule");
        self.sink.on_timed_out().await;
        Some(TransactionOutcome::TimedOut)
    }

    /// Called by the owner when a packet matching this transaction's id arrives.
    /// If the sink accepts it, the transaction ends with `Succeeded`.
    pub async fn handle_candidate_response(&self, response: &StunMessage) -> bool {
        {
            let inner = self.inner.lock().await;
            if inner.state == State::Done {
                return false;
            }
        }
        if self.sink.on_response(response).await {
            let mut inner = self.inner.lock().await;
            inner.state = State::Done;
            inner.outcome = Some(TransactionOutcome::Succeeded);
            debug!("stun requester: transaction succeeded");
            true
        } else {
            false
        }
    }

    /// Forces an immediate retransmission by collapsing the current `Awaiting`
    /// wait to zero (spec §4.1 `retryRequestNow`).
    pub async fn retry_request_now(&self) {
        if self.inner.lock().await.state != State::Done {
            self.retry_now.notify_one();
        }
    }

    /// Terminates the transaction; subsequent events are suppressed (spec §4.1 `cancel`).
    /// A no-op once the transaction already reached a terminal outcome, so a
    /// late `cancel()` race can't stomp a recorded `Succeeded`/`TimedOut`.
    pub async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != State::Done {
            inner.state = State::Done;
        }
    }

    /// True once the transaction has ended (succeeded, timed out, or canceled).
    pub async fn is_done(&self) -> bool {
        self.inner.lock().await.state == State::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        sends: Arc<AtomicUsize>,
        accept: bool,
    }

    #[async_trait]
    impl StunRequesterSink for CountingSink {
        async fn send_packet(&self, _destination: SocketAddr, _packet: Bytes) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_response(&self, _response: &StunMessage) -> bool {
            self.accept
        }

        async fn on_timed_out(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn retransmits_then_times_out() {
        let sends = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            sends: sends.clone(),
            accept: false,
        };
        let profile = RetryProfile {
            initial_rto: Duration::from_millis(10),
            retransmissions: 2,
            final_timeout_multiplier: 1,
        };
        let requester = StunRequester::create(
            "127.0.0.1:1".parse().unwrap(),
            crate::stun::StunMessage::new(crate::stun::MessageType::BindingRequest),
            Bytes::from_static(b"x"),
            profile,
            sink,
        );

        let outcome = requester.run().await;
        assert_eq!(outcome, Some(TransactionOutcome::TimedOut));
        assert_eq!(sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn accepted_response_ends_transaction() {
        let sends = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            sends: sends.clone(),
            accept: true,
        };
        let requester = Arc::new(StunRequester::create(
            "127.0.0.1:1".parse().unwrap(),
            crate::stun::StunMessage::new(crate::stun::MessageType::BindingRequest),
            Bytes::from_static(b"x"),
            RetryProfile::rfc5389_default(),
            sink,
        ));

        let r = requester.clone();
        let handle = tokio::spawn(async move { r.run().await });

        tokio::task::yield_now().await;
        let response = crate::stun::StunMessage::new(crate::stun::MessageType::BindingResponse);
        assert!(requester.handle_candidate_response(&response).await);

        // run() only observes Done on its next wake; cancel to unblock the test deterministically.
        requester.cancel().await;
        let _ = handle.await;
        assert!(requester.is_done().await);
    }
}
