//! Re-exports of the event enums owners receive over an `mpsc` channel.
//!
//! `SessionEvent`/`ChannelEvent` live next to the types they describe
//! ([`crate::ice`], [`crate::rudp`]); this module just gives callers a single
//! import path, the way `nyx-transport::PacketHandler` gives callers one trait
//! to implement instead of reaching into the transport's internals.

pub use crate::ice::SessionEvent;
pub use crate::rudp::ChannelEvent;
