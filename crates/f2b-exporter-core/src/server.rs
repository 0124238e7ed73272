//! HTTP server: landing page, metrics endpoint and health check.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::BoxFuture;
use crate::exporter::ShutdownSignal;
use crate::metrics::ExporterMetrics;
use crate::protocol::{ConnectionState, Dialer, ExtractError, Jail, StatusClient};

/// Where a scrape gets its jails from.
pub trait JailSource: Send + Sync + 'static {
    fn poll(&self) -> BoxFuture<'_, Result<Vec<Jail>, ExtractError>>;

    fn daemon_state(&self) -> ConnectionState;

    /// Release whatever connection backs the source.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

impl<D: Dialer> JailSource for StatusClient<D> {
    fn poll(&self) -> BoxFuture<'_, Result<Vec<Jail>, ExtractError>> {
        Box::pin(self.get_all_jails())
    }

    fn daemon_state(&self) -> ConnectionState {
        self.state()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(StatusClient::close(self))
    }
}

/// Shared state accessible to all route handlers.
pub struct ServerState {
    pub source: Arc<dyn JailSource>,
    pub metrics: ExporterMetrics,
    pub telemetry_path: String,
    /// Serializes scrapes so one scrape's reset never interleaves with
    /// another's render.
    scrape_lock: Mutex<()>,
}

impl ServerState {
    pub fn new(
        source: Arc<dyn JailSource>,
        metrics: ExporterMetrics,
        telemetry_path: impl Into<String>,
    ) -> Self {
        Self {
            source,
            metrics,
            telemetry_path: telemetry_path.into(),
            scrape_lock: Mutex::new(()),
        }
    }

    /// Poll the daemon once, publish the result and render the registry.
    pub async fn scrape(&self) -> Result<String, crate::metrics::MetricsError> {
        let _guard = self.scrape_lock.lock().await;
        match self.source.poll().await {
            Ok(jails) => self.metrics.record(Some(&jails)),
            Err(e) => {
                warn!(error = %e, "failed to collect fail2ban metrics");
                self.metrics.record(None);
            }
        }
        self.metrics.render()
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
    pub daemon_state: String,
}

/// Build the axum router.
pub fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route(&state.telemetry_path, get(handle_metrics))
        .with_state(state)
}

/// Serve on `listener` until the shutdown signal is received.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    info!(
        addr = %listener.local_addr()?,
        path = %state.telemetry_path,
        "HTTP server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("HTTP server shutting down");
        })
        .await
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_index(State(state): State<Arc<ServerState>>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Fail2ban Exporter</title></head>\n\
         <body>\n\
         <h1>Fail2ban Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        path = state.telemetry_path
    ))
}

async fn handle_metrics(State(state): State<Arc<ServerState>>) -> Response {
    match state.scrape().await {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::build_info::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH.to_string(),
        build_profile: crate::build_info::BUILD_PROFILE.to_string(),
        daemon_state: state.source.daemon_state().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// Serves a fixed poll result.
    struct FixedSource {
        jails: Option<Vec<Jail>>,
    }

    impl JailSource for FixedSource {
        fn poll(&self) -> BoxFuture<'_, Result<Vec<Jail>, ExtractError>> {
            let result = match &self.jails {
                Some(jails) => Ok(jails.clone()),
                None => Err(ExtractError::DaemonReportedFailure {
                    code: 1,
                    detail: "down".to_string(),
                }),
            };
            Box::pin(async move { result })
        }

        fn daemon_state(&self) -> ConnectionState {
            if self.jails.is_some() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }
    }

    fn test_state(jails: Option<Vec<Jail>>) -> Arc<ServerState> {
        Arc::new(ServerState::new(
            Arc::new(FixedSource { jails }),
            ExporterMetrics::new().unwrap(),
            "/metrics",
        ))
    }

    fn sshd() -> Jail {
        Jail {
            name: "sshd".to_string(),
            currently_failed: 3,
            total_failed: 10,
            currently_banned: 1,
            total_banned: 4,
        }
    }

    async fn request(state: Arc<ServerState>, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_index_links_to_metrics() {
        let (status, content_type, body) = request(test_state(Some(vec![])), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert!(body.contains("<title>Fail2ban Exporter</title>"));
        assert!(body.contains(r#"<a href="/metrics">"#));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_jails() {
        let (status, content_type, body) = request(test_state(Some(vec![sshd()])), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert!(body.contains("fail2ban_up 1"));
        assert!(body.contains(r#"fail2ban_banned_total{jail="sshd"} 4"#));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_down() {
        let (status, _, body) = request(test_state(None), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("fail2ban_up 0"));
        assert!(!body.contains("sshd"));
    }

    #[tokio::test]
    async fn test_custom_telemetry_path() {
        let state = Arc::new(ServerState::new(
            Arc::new(FixedSource { jails: Some(vec![]) }),
            ExporterMetrics::new().unwrap(),
            "/probe",
        ));
        let (status, _, _) = request(Arc::clone(&state), "/probe").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = request(state, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_daemon_state() {
        let (status, _, body) = request(test_state(None), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, crate::build_info::VERSION);
        assert_eq!(health.daemon_state, "disconnected");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(serve(listener, test_state(Some(vec![])), rx));

        tx.send(ShutdownSignal).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
