//! Scripted fake of the OS seam.
//!
//! The fake lives in `loopbridge-core` (behind its `testing` feature) so that
//! the crate's own unit tests and downstream crates share a single definition
//! against one instance of the `HostNetwork` trait. This module re-exports it
//! for backwards compatibility with `loopbridge_test_utils::host::FakeHost`.

pub use loopbridge_core::testing::FakeHost;
