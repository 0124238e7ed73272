#![deny(unsafe_code)]

//! fail2ban exporter core.
//!
//! A client for fail2ban's control socket plus the pieces that turn its
//! jail counters into Prometheus metrics served over HTTP. The CLI crate is
//! a thin shell around [`Exporter`].

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used wherever a trait is
/// consumed as `dyn Trait` (dialers, jail sources).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Exporter runtime: startup, serve loop and shutdown.
pub mod exporter;
/// Prometheus gauges for jail counters.
pub mod metrics;
/// fail2ban socket protocol: codec, framing, connection and status extraction.
pub mod protocol;
/// HTTP routes.
pub mod server;

pub use exporter::{Exporter, ExporterError, ShutdownSignal};
pub use metrics::{ExporterMetrics, MetricsError};
pub use protocol::{ConnectionManager, ConnectionState, ExtractError, Jail, StatusClient};
pub use server::JailSource;
