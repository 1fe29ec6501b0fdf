#![forbid(unsafe_code)]

//! ICE (RFC 5245) session engine and Reliable UDP channel over a shared STUN
//! requester.
//!
//! This crate implements the two tightly coupled state machines that find and
//! maintain a working UDP path between two NATed peers and carry a reliable
//! byte stream over it:
//!
//! - [`ice`] — candidate pairing, prioritized connectivity checks, nomination,
//!   role-conflict resolution, and liveness.
//! - [`rudp`] — a STUN-driven channel-open/refresh/close handshake layered
//!   over a nominated ICE pair, carrying payload through an injected
//!   [`rudp::ReliableStream`].
//!
//! Both share [`stun`] (the RFC 5389/5245 wire codec) and
//! [`stun_requester`] (the retransmit-with-backoff transaction that drives one
//! request to a response or a timeout). [`scheduler`] supplies the timer/wake
//! glue that ticks each session and channel's periodic work, and [`events`]
//! re-exports the event enums an owner receives over an `mpsc` channel.
//!
//! Out of scope, per the design this crate targets: the UDP socket
//! abstraction and TURN relay logic, candidate gathering, the reliable
//! stream's sliding-window/SACK codec (used here only through the
//! [`rudp::ReliableStream`] trait), higher-level peer-identity/encryption
//! layers, and persistence.

pub mod config;
pub mod error;
pub mod events;
pub mod ice;
pub mod rudp;
pub mod scheduler;
pub mod stun;
pub mod stun_requester;

pub use config::{IceSessionConfig, RudpChannelConfig};
pub use error::ErrorReason;
pub use events::{ChannelEvent, SessionEvent};
pub use ice::{Candidate, CandidateKind, IceRole, IceSession, SessionState};
pub use rudp::{ChannelState, RudpChannel, ShutdownDirection};
pub use scheduler::{ChannelId, IceSessionRegistry, RudpChannelRegistry, SessionId};
