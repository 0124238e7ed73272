//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. The defaults favour fast
//! tests: short backoff and short waits.

use std::path::Path;

use f2b_exporter_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .socket_path(daemon.socket_path())
///     .max_attempts(3)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.socket.read_timeout_ms = 2_000;
        config.reconnect.initial_interval_ms = 10;
        config.reconnect.max_interval_ms = 50;
        config.reconnect.dial_timeout_ms = 500;
        config.reconnect.connect_wait_ms = 1_000;
        config.web.listen_address = "127.0.0.1:0".to_string();
        Self { config }
    }

    pub fn socket_path(mut self, path: &Path) -> Self {
        self.config.socket.path = path.display().to_string();
        self
    }

    pub fn sentinel_scan(mut self, scan: &str) -> Self {
        self.config.socket.sentinel_scan = scan.to_string();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = Some(attempts);
        self
    }

    pub fn connect_wait_ms(mut self, ms: u64) -> Self {
        self.config.reconnect.connect_wait_ms = ms;
        self
    }

    pub fn telemetry_path(mut self, path: &str) -> Self {
        self.config.web.telemetry_path = path.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
