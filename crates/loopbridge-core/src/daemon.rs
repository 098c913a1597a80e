//! Core daemon process — startup, shutdown, and main control loop.
//!
//! The [`Daemon`] value is owned by the process's main loop and handed by
//! reference to anything that needs to request shutdown; there is no
//! process-wide static holding "the current instance".

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use loopbridge_config::AppConfig;

use crate::elevation::{EuidProbe, PrivilegeProbe};
use crate::ipc::server::{self, ServerError};
use crate::netstate::inspect::HostNetwork;
use crate::netstate::{NetState, SystemNetwork};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The loopbridge daemon: listener plus network-state engine.
pub struct Daemon {
    config: AppConfig,
    state: Arc<NetState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Daemon {
    /// Create a daemon over the real OS backends.
    pub fn new(config: AppConfig) -> Result<Self, DaemonError> {
        Self::with_backends(config, Arc::new(SystemNetwork::new()), Arc::new(EuidProbe))
    }

    /// Create a daemon with explicit OS backends (tests substitute fakes).
    pub fn with_backends(
        config: AppConfig,
        host: Arc<dyn HostNetwork>,
        probe: Arc<dyn PrivilegeProbe>,
    ) -> Result<Self, DaemonError> {
        let state = NetState::from_config(&config, host, probe)
            .map_err(|e| DaemonError::Startup(e.to_string()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            state: Arc::new(state),
            shutdown_tx,
        })
    }

    /// Run the daemon until a shutdown signal or Ctrl-C.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let socket_path = self.socket_path();
        info!(socket = %socket_path.display(), "loopbridge daemon starting");

        let server_rx = self.shutdown_tx.subscribe();
        let mut server_task = tokio::spawn(server::serve(
            socket_path,
            Arc::clone(&self.state),
            server_rx,
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = &mut server_task => {
                // Listener ended on its own: bind failure or fatal IO.
                return result.map_err(|e| DaemonError::Startup(e.to_string()))?.map_err(Into::into);
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                let _ = self.shutdown_tx.send(ShutdownSignal);
            }
        }

        match server_task.await {
            Ok(result) => result?,
            Err(e) => return Err(DaemonError::Startup(e.to_string())),
        }
        info!("daemon stopped");
        Ok(())
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// The network-state engine, shared with the listener.
    pub fn state(&self) -> Arc<NetState> {
        Arc::clone(&self.state)
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.config.daemon.socket_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::FixedProbe;
    use loopbridge_test_utils::config::TestConfigBuilder;
    use crate::testing::FakeHost;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_daemon_creation() {
        let config = AppConfig::default();
        let daemon = Daemon::with_backends(config, FakeHost::new(), Arc::new(FixedProbe(true)))
            .unwrap();
        assert_eq!(daemon.config().daemon.socket_path, "/tmp/loopbridge.sock");
    }

    #[tokio::test]
    async fn test_daemon_rejects_invalid_pool() {
        let config = TestConfigBuilder::new().pool_cidr("not-a-cidr").build();
        let result = Daemon::with_backends(config, FakeHost::new(), Arc::new(FixedProbe(true)));
        assert!(matches!(result, Err(DaemonError::Startup(_))));
    }

    #[tokio::test]
    async fn test_daemon_shutdown_stops_run() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("hosts"), "127.0.0.1 localhost\n")
            .await
            .unwrap();
        let config = TestConfigBuilder::new().rooted_in(tmp.path()).build();

        let daemon = std::sync::Arc::new(
            Daemon::with_backends(config, FakeHost::new(), Arc::new(FixedProbe(true))).unwrap(),
        );

        let runner = Arc::clone(&daemon);
        let task = tokio::spawn(async move { runner.run().await });

        // Let the listener bind, then ask it to stop.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        daemon.shutdown();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("daemon did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
