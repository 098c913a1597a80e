//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use loopbridge_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .socket_path("/tmp/lb-test.sock")
///     .pool_cidr("127.9.0.0/24")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    /// Point every filesystem-touching setting into `dir`, so a test never
    /// reaches the real socket or hosts file.
    pub fn rooted_in(mut self, dir: &Path) -> Self {
        self.config.daemon.socket_path = dir.join("loopbridge.sock").display().to_string();
        self.config.hosts.path = dir.join("hosts").display().to_string();
        self
    }

    pub fn socket_path(mut self, path: &str) -> Self {
        self.config.daemon.socket_path = path.to_string();
        self
    }

    pub fn pool_cidr(mut self, cidr: &str) -> Self {
        self.config.pool.cidr = cidr.to_string();
        self
    }

    pub fn hosts_path(mut self, path: &str) -> Self {
        self.config.hosts.path = path.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn process_exit_secs(mut self, secs: u64) -> Self {
        self.config.timeouts.process_exit_secs = secs;
        self
    }

    pub fn service_stop_secs(mut self, secs: u64) -> Self {
        self.config.timeouts.service_stop_secs = secs;
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
