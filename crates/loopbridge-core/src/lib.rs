#![deny(unsafe_code)]

//! loopbridge core daemon runtime.
//!
//! Provides the privileged daemon that redirects local network traffic to a
//! remote cluster workload: loopback address allocation, hosts-file entries,
//! and freeing ports held by other processes. All other components (CLI,
//! agent containers) talk to the daemon through the framed socket protocol
//! in [`ipc`].

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits (stable since Rust 1.75) produces opaque return
/// types that are **not** object-safe. Traits consumed via `Box<dyn Trait>` or
/// `&dyn Trait` must return a concrete `Pin<Box<dyn Future>>` instead. This
/// alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Async daemon runtime and shutdown coordination.
pub mod daemon;
/// Privilege probing and the elevation-request contract.
pub mod elevation;
/// Socket protocol: framing, envelope codec, client stub, and listener.
pub mod ipc;
/// Rotating process-tagged log files.
pub mod logging;
/// Network-state engine: address pool, hosts file, port conflicts, sessions.
pub mod netstate;

/// Scripted fakes of the OS seam for tests. Available to the crate's own
/// tests and, for downstream crates, behind the `testing` feature.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use daemon::Daemon;
pub use elevation::{ElevationRequest, PrivilegeProbe};
pub use ipc::client::DaemonClient;
pub use netstate::NetState;
