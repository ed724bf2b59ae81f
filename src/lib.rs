//! sharefs: a resilient network-share filesystem layer.
//!
//! Exposes path/handle filesystem operations to a host handler that only
//! understands plain integers and path strings, over a remote session that
//! may drop, require re-authentication, or throttle under load. The wire
//! protocol is pluggable behind [`client::ShareClient`]; this crate owns
//! what sits above it:
//!
//! - [`handles`]: generational slot map turning session-owned resource
//!   references into stable-width integer handles.
//! - [`session`]: session lifecycle and the connection fault state machine.
//! - [`ops`]: the operation surface, outcome classification and retry,
//!   and transparent stream-handle recovery after reconnects.
//! - [`flow`]: response-drain batching, keep-alives and adaptive write
//!   chunk sizing for long transfers.
//! - [`config`]: mount options and the subtree restriction normalizer.

pub mod client;
pub mod config;
pub mod flow;
pub mod handles;
pub mod ops;
pub mod session;
