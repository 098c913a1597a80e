//! Socket protocol between the daemon and its clients.
//!
//! Messages are JSON envelopes delimited by a sentinel byte sequence over a
//! Unix domain socket. [`framing`] owns the byte-level discipline,
//! [`envelope`] the request/response codec, [`types`] the closed operation
//! set, and [`client`]/[`server`] the two ends of the connection.

pub mod client;
pub mod envelope;
pub mod framing;
pub mod server;
pub mod types;

/// Default Unix socket path for daemon IPC.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/loopbridge.sock";

/// Protocol version carried in every envelope. Bump only for additive
/// changes; decoders must accept envelopes without the field (treated as 1).
pub const PROTOCOL_VERSION: u32 = 1;
