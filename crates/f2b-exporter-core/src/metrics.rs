//! Prometheus gauges for jail counters.
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `fail2ban_up` | |
//! | `fail2ban_failed_current` | `jail` |
//! | `fail2ban_failed_total` | `jail` |
//! | `fail2ban_banned_current` | `jail` |
//! | `fail2ban_banned_total` | `jail` |
//!
//! Every scrape starts from empty per-jail vectors, so jails removed from
//! the daemon disappear from the output on the next scrape.

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::protocol::Jail;

/// Errors from building or rendering the registry.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[source] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// The exporter's metric families, registered in a private registry.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    up: Gauge,
    failed_current: GaugeVec,
    failed_total: GaugeVec,
    banned_current: GaugeVec,
    banned_total: GaugeVec,
}

impl ExporterMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let up = Gauge::with_opts(Opts::new(
            "fail2ban_up",
            "Whether collecting fail2ban's metrics was successful.",
        ))
        .map_err(MetricsError::Registration)?;
        registry
            .register(Box::new(up.clone()))
            .map_err(MetricsError::Registration)?;

        let per_jail = |name: &str, help: &str| -> Result<GaugeVec, MetricsError> {
            let gauge = GaugeVec::new(Opts::new(name, help), &["jail"])
                .map_err(MetricsError::Registration)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(MetricsError::Registration)?;
            Ok(gauge)
        };

        Ok(Self {
            failed_current: per_jail(
                "fail2ban_failed_current",
                "Number of currently failed connections by jail.",
            )?,
            failed_total: per_jail(
                "fail2ban_failed_total",
                "Number of total failed connections by jail.",
            )?,
            banned_current: per_jail(
                "fail2ban_banned_current",
                "Number of currently banned connections by jail.",
            )?,
            banned_total: per_jail(
                "fail2ban_banned_total",
                "Number of total banned connections by jail.",
            )?,
            registry,
            up,
        })
    }

    /// Publish the outcome of one poll. `None` means the poll failed: no
    /// jail series and `fail2ban_up 0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&self, jails: Option<&[Jail]>) {
        for vec in [
            &self.failed_current,
            &self.failed_total,
            &self.banned_current,
            &self.banned_total,
        ] {
            vec.reset();
        }

        let Some(jails) = jails else {
            self.up.set(0.0);
            return;
        };

        for jail in jails {
            let labels = [jail.name.as_str()];
            self.failed_current
                .with_label_values(&labels)
                .set(jail.currently_failed as f64);
            self.failed_total
                .with_label_values(&labels)
                .set(jail.total_failed as f64);
            self.banned_current
                .with_label_values(&labels)
                .set(jail.currently_banned as f64);
            self.banned_total
                .with_label_values(&labels)
                .set(jail.total_banned as f64);
        }
        self.up.set(1.0);
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// `Content-Type` of [`render`](Self::render)'s output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
