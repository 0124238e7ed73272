//! Exporter process: startup, shutdown and the serve loop.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use f2b_exporter_config::{AppConfig, ConfigError};

use crate::metrics::{ExporterMetrics, MetricsError};
use crate::protocol::StatusClient;
use crate::server::{self, JailSource, ServerState};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The fail2ban exporter: one status client, one registry, one HTTP server.
pub struct Exporter {
    config: AppConfig,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    _shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

impl Exporter {
    /// Create an exporter talking to the socket named in `config`.
    ///
    /// Nothing is dialed until the first scrape.
    pub fn new(config: AppConfig) -> Result<Self, ExporterError> {
        let client = StatusClient::from_config(&config);
        Self::with_source(config, Arc::new(client))
    }

    /// Create an exporter that polls `source` instead of the configured socket.
    pub fn with_source(
        config: AppConfig,
        source: Arc<dyn JailSource>,
    ) -> Result<Self, ExporterError> {
        config.validate()?;
        let metrics = ExporterMetrics::new()?;
        let state = Arc::new(ServerState::new(
            source,
            metrics,
            config.web.telemetry_path.clone(),
        ));
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            config,
            state,
            shutdown_tx,
            _shutdown_rx,
        })
    }

    /// Bind the configured listen address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ExporterError> {
        let addr = self.config.web.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener until Ctrl-C or [`shutdown`](Self::shutdown).
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ExporterError> {
        info!(
            socket = %self.config.socket.path,
            version = %crate::build_info::version_string(),
            "Starting fail2ban exporter"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut server = tokio::spawn(server::serve(
            listener,
            Arc::clone(&self.state),
            self.shutdown_tx.subscribe(),
        ));

        let served = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping exporter");
                None
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                let _ = self.shutdown_tx.send(ShutdownSignal);
                None
            }
            result = &mut server => Some(result),
        };

        let served = match served {
            Some(result) => result,
            None => server.await,
        };

        self.state.source.close().await;
        info!("Exporter stopped");

        served.map_err(|e| ExporterError::Task(e.to_string()))??;
        Ok(())
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Run one scrape outside of HTTP and return the rendered metrics.
    pub async fn scrape(&self) -> Result<String, ExporterError> {
        Ok(self.state.scrape().await?)
    }
}

/// Errors from the exporter runtime.
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::protocol::{ConnectionState, ExtractError, Jail};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        closed: AtomicBool,
    }

    impl JailSource for CountingSource {
        fn poll(&self) -> BoxFuture<'_, Result<Vec<Jail>, ExtractError>> {
            Box::pin(async {
                Ok(vec![Jail {
                    name: "sshd".to_string(),
                    currently_failed: 0,
                    total_failed: 5,
                    currently_banned: 0,
                    total_banned: 2,
                }])
            })
        }

        fn daemon_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            self.closed.store(true, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.web.telemetry_path = "metrics".to_string();
        assert!(matches!(
            Exporter::new(config),
            Err(ExporterError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_scrape_without_server() {
        let exporter =
            Exporter::with_source(AppConfig::default(), Arc::new(CountingSource::default()))
                .unwrap();
        let text = exporter.scrape().await.unwrap();
        assert!(text.contains(r#"fail2ban_failed_total{jail="sshd"} 5"#));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run_and_closes_session() {
        let source = Arc::new(CountingSource::default());
        let exporter = Arc::new(
            Exporter::with_source(AppConfig::default(), Arc::clone(&source) as Arc<dyn JailSource>)
                .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let runner = {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move { exporter.run_on(listener).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        exporter.shutdown();

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(source.closed.load(Ordering::SeqCst));
    }
}
