#![deny(unsafe_code)]

//! Shared test utilities for the loopbridge workspace.
//!
//! Provides reusable fixtures, a scripted fake of the OS seam, config
//! builders, and tracing helpers so that individual crate tests stay
//! concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! loopbridge-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod host;
pub mod tracing_setup;
