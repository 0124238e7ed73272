#![deny(unsafe_code)]

//! Shared test utilities for the fail2ban exporter workspace.
//!
//! Provides a scripted fake fail2ban daemon and config builders so that
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! f2b-exporter-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;

pub use daemon::FakeDaemon;
