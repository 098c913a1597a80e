//! Port conflict resolution.
//!
//! The owner of a contested port is looked up live at call time, never
//! from cached state. A user process gets SIGTERM with a bounded wait and
//! a SIGKILL escalation; a service-managed owner goes through the service
//! manager with a bounded stop wait. A port that is already free succeeds
//! trivially.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use super::inspect::{HostNetwork, OsError, PortOwner};
use crate::ipc::types::TargetOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum FreeError {
    TimedOut,
    Os(OsError),
}

impl From<OsError> for FreeError {
    fn from(e: OsError) -> Self {
        FreeError::Os(e)
    }
}

/// Free `port` whatever currently holds it, reporting a per-item outcome.
pub async fn free_port(
    host: &dyn HostNetwork,
    port: u16,
    process_wait: Duration,
    service_wait: Duration,
) -> TargetOutcome {
    let owner = match host.port_owner(port).await {
        Ok(owner) => owner,
        Err(e) => return TargetOutcome::failed(port, format!("port inspection failed: {e}")),
    };

    match owner {
        None => TargetOutcome::ok(port, "already free"),
        Some(PortOwner::Process { pid, name }) => {
            match terminate_process(host, pid, process_wait).await {
                Ok(()) => {
                    info!(port, pid, process = %name, "terminated port owner");
                    TargetOutcome::ok(port, format!("terminated {name} (pid {pid})"))
                }
                Err(FreeError::TimedOut) => TargetOutcome::failed(
                    port,
                    format!("timed out waiting for pid {pid} to exit"),
                ),
                Err(FreeError::Os(e)) => TargetOutcome::failed(port, e.to_string()),
            }
        }
        Some(PortOwner::Service { unit, .. }) => {
            match stop_service(host, &unit, service_wait).await {
                Ok(()) => {
                    info!(port, unit = %unit, "stopped port-owning service");
                    TargetOutcome::ok(port, format!("stopped {unit}"))
                }
                Err(FreeError::TimedOut) => TargetOutcome::failed(
                    port,
                    format!("timed out waiting for {unit} to stop"),
                ),
                Err(FreeError::Os(e)) => TargetOutcome::failed(port, e.to_string()),
            }
        }
    }
}

/// SIGTERM, bounded wait, then SIGKILL with one more bounded wait.
async fn terminate_process(
    host: &dyn HostNetwork,
    pid: i32,
    wait: Duration,
) -> Result<(), FreeError> {
    if !host.process_alive(pid) {
        return Ok(());
    }
    match host.signal_process(pid, Signal::SIGTERM) {
        // Exited between the liveness probe and the signal.
        Err(OsError::Signal {
            errno: Errno::ESRCH,
            ..
        }) => return Ok(()),
        Err(e) => return Err(e.into()),
        Ok(()) => {}
    }
    if wait_until_gone(host, pid, wait).await {
        return Ok(());
    }

    warn!(pid, "process ignored SIGTERM, escalating to SIGKILL");
    match host.signal_process(pid, Signal::SIGKILL) {
        Err(OsError::Signal {
            errno: Errno::ESRCH,
            ..
        }) => return Ok(()),
        Err(e) => return Err(e.into()),
        Ok(()) => {}
    }
    if wait_until_gone(host, pid, wait).await {
        Ok(())
    } else {
        Err(FreeError::TimedOut)
    }
}

/// Stop `unit` and wait, bounded, for it to report inactive.
async fn stop_service(
    host: &dyn HostNetwork,
    unit: &str,
    wait: Duration,
) -> Result<(), FreeError> {
    host.stop_service(unit).await?;

    let deadline = Instant::now() + wait;
    loop {
        if !host.service_active(unit).await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(FreeError::TimedOut);
        }
        sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
    }
}

async fn wait_until_gone(host: &dyn HostNetwork, pid: i32, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if !host.process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_free_port_already_free() {
        let host = FakeHost::new();
        let outcome = free_port(&*host, 8080, WAIT, WAIT).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.detail.as_deref(), Some("already free"));
        assert!(host.signals().is_empty());
    }

    #[tokio::test]
    async fn test_free_port_terminates_process() {
        let host = FakeHost::new();
        host.add_process(100, true);
        host.set_port_owner(
            8080,
            PortOwner::Process {
                pid: 100,
                name: "devserver".into(),
            },
        );

        let outcome = free_port(&*host, 8080, WAIT, WAIT).await;
        assert!(outcome.succeeded, "{:?}", outcome.detail);
        assert!(outcome.detail.unwrap().contains("devserver"));
        assert_eq!(host.signals(), vec![(100, Signal::SIGTERM)]);
    }

    #[tokio::test]
    async fn test_free_port_escalates_to_sigkill() {
        let host = FakeHost::new();
        // Ignores SIGTERM, dies on SIGKILL.
        host.add_process(100, false);
        host.set_port_owner(
            8080,
            PortOwner::Process {
                pid: 100,
                name: "stubborn".into(),
            },
        );

        let outcome = free_port(&*host, 8080, WAIT, WAIT).await;
        assert!(outcome.succeeded);
        assert_eq!(
            host.signals(),
            vec![(100, Signal::SIGTERM), (100, Signal::SIGKILL)]
        );
    }

    #[tokio::test]
    async fn test_free_port_reports_timeout() {
        let host = FakeHost::new();
        host.add_immortal_process(100);
        host.set_port_owner(
            8080,
            PortOwner::Process {
                pid: 100,
                name: "immortal".into(),
            },
        );

        let outcome = free_port(&*host, 8080, WAIT, WAIT).await;
        assert!(!outcome.succeeded);
        assert!(outcome.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_free_port_stops_service_not_process() {
        let host = FakeHost::new();
        host.add_unit("nginx.service", true);
        host.set_port_owner(
            80,
            PortOwner::Service {
                pid: 50,
                unit: "nginx.service".into(),
            },
        );

        let outcome = free_port(&*host, 80, WAIT, WAIT).await;
        assert!(outcome.succeeded);
        assert!(outcome.detail.unwrap().contains("nginx.service"));
        assert_eq!(host.stopped_units(), vec!["nginx.service".to_string()]);
        // Service path never delivers signals.
        assert!(host.signals().is_empty());
    }

    #[tokio::test]
    async fn test_free_port_service_stop_timeout() {
        let host = FakeHost::new();
        host.add_unit("wedged.service", false);
        host.set_port_owner(
            80,
            PortOwner::Service {
                pid: 50,
                unit: "wedged.service".into(),
            },
        );

        let outcome = free_port(&*host, 80, WAIT, WAIT).await;
        assert!(!outcome.succeeded);
        assert!(outcome.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stale_pid_is_trivial_success() {
        let host = FakeHost::new();
        // Owner recorded but the process is already gone.
        host.set_port_owner(
            8080,
            PortOwner::Process {
                pid: 999,
                name: "ghost".into(),
            },
        );

        let outcome = free_port(&*host, 8080, WAIT, WAIT).await;
        assert!(outcome.succeeded);
    }
}
