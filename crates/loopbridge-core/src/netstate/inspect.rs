//! OS inspection and surgery behind a trait seam.
//!
//! [`HostNetwork`] is the only path through which the engine touches the
//! operating system: interface enumeration, loopback aliases, port-owner
//! lookup, signals, and service control. The production implementation
//! shells out to `ip`, `ss`, `ps`, and `systemctl`; tests substitute a
//! scripted fake.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Output;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::debug;

use crate::BoxFuture;

/// Errors from OS inspection and mutation.
#[derive(Debug, thiserror::Error)]
pub enum OsError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("signal delivery to pid {pid} failed: {errno}")]
    Signal { pid: i32, errno: nix::errno::Errno },

    #[error("could not parse {what} output: {detail}")]
    Parse {
        what: &'static str,
        detail: String,
    },
}

/// What currently holds a local port, captured at the moment of inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOwner {
    /// An ordinary user process.
    Process { pid: i32, name: String },
    /// A process managed by the service manager as a unit.
    Service { pid: i32, unit: String },
}

/// The seam between the network-state engine and the operating system.
pub trait HostNetwork: Send + Sync {
    /// Addresses currently assigned to any host interface.
    fn interface_addresses(&self) -> BoxFuture<'_, Result<HashSet<IpAddr>, OsError>>;

    /// Add `ip` as a /32 alias on the loopback interface.
    fn add_loopback_alias(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), OsError>>;

    /// Remove a previously added loopback alias.
    fn remove_loopback_alias(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), OsError>>;

    /// Current owner of `port`, or `None` when nothing is listening.
    /// Always inspected live; ownership can change between calls.
    fn port_owner(&self, port: u16) -> BoxFuture<'_, Result<Option<PortOwner>, OsError>>;

    /// Deliver `signal` to `pid`.
    fn signal_process(&self, pid: i32, signal: Signal) -> Result<(), OsError>;

    /// Whether `pid` still exists.
    fn process_alive(&self, pid: i32) -> bool;

    /// Ask the service manager to stop `unit`. Returns without waiting.
    fn stop_service(&self, unit: &str) -> BoxFuture<'_, Result<(), OsError>>;

    /// Whether `unit` is currently active.
    fn service_active(&self, unit: &str) -> BoxFuture<'_, Result<bool, OsError>>;
}

/// Production [`HostNetwork`] backed by the system's network and service
/// management tooling.
#[derive(Debug, Default)]
pub struct SystemNetwork;

impl SystemNetwork {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> Result<Output, OsError> {
        let rendered = format!("{program} {}", args.join(" "));
        debug!(command = %rendered, "running host command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| OsError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(OsError::CommandFailed {
                command: rendered,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl HostNetwork for SystemNetwork {
    fn interface_addresses(&self) -> BoxFuture<'_, Result<HashSet<IpAddr>, OsError>> {
        Box::pin(async {
            let output = Self::run("ip", &["-o", "addr", "show"]).await?;
            Ok(parse_interface_addresses(&String::from_utf8_lossy(
                &output.stdout,
            )))
        })
    }

    fn add_loopback_alias(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), OsError>> {
        Box::pin(async move {
            let cidr = format!("{ip}/32");
            Self::run("ip", &["addr", "add", cidr.as_str(), "dev", "lo"]).await?;
            Ok(())
        })
    }

    fn remove_loopback_alias(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), OsError>> {
        Box::pin(async move {
            let cidr = format!("{ip}/32");
            Self::run("ip", &["addr", "del", cidr.as_str(), "dev", "lo"]).await?;
            Ok(())
        })
    }

    fn port_owner(&self, port: u16) -> BoxFuture<'_, Result<Option<PortOwner>, OsError>> {
        Box::pin(async move {
            let filter = format!("sport = :{port}");
            // Listening TCP sockets first, then UDP.
            for flags in ["-Hlptn", "-Hlpun"] {
                let output = Self::run("ss", &[flags, filter.as_str()]).await?;
                let text = String::from_utf8_lossy(&output.stdout);
                if let Some((name, pid)) = text.lines().find_map(parse_socket_owner) {
                    return Ok(Some(classify_owner(pid, name).await?));
                }
            }
            Ok(None)
        })
    }

    fn signal_process(&self, pid: i32, signal: Signal) -> Result<(), OsError> {
        nix::sys::signal::kill(Pid::from_raw(pid), signal)
            .map_err(|errno| OsError::Signal { pid, errno })
    }

    fn process_alive(&self, pid: i32) -> bool {
        // Signal 0 probes existence without delivering anything.
        nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
    }

    fn stop_service(&self, unit: &str) -> BoxFuture<'_, Result<(), OsError>> {
        let unit = unit.to_string();
        Box::pin(async move {
            Self::run("systemctl", &["stop", unit.as_str()]).await?;
            Ok(())
        })
    }

    fn service_active(&self, unit: &str) -> BoxFuture<'_, Result<bool, OsError>> {
        let unit = unit.to_string();
        Box::pin(async move {
            // `is-active` exits non-zero for inactive units; that is an
            // answer, not a failure.
            let rendered = format!("systemctl is-active {unit}");
            let output = Command::new("systemctl")
                .args(["is-active", &unit])
                .output()
                .await
                .map_err(|source| OsError::Spawn {
                    command: rendered,
                    source,
                })?;
            Ok(output.status.success())
        })
    }
}

/// Which unit, if any, manages `pid`, deciding the process/service split.
async fn classify_owner(pid: i32, name: String) -> Result<PortOwner, OsError> {
    let pid_str = pid.to_string();
    let rendered = format!("ps -o unit= -p {pid_str}");
    let output = Command::new("ps")
        .args(["-o", "unit=", "-p", pid_str.as_str()])
        .output()
        .await
        .map_err(|source| OsError::Spawn {
            command: rendered,
            source,
        })?;
    let unit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() && unit.ends_with(".service") {
        Ok(PortOwner::Service { pid, unit })
    } else {
        Ok(PortOwner::Process { pid, name })
    }
}

/// Parse `ip -o addr show` output into the set of assigned addresses.
///
/// Each line looks like:
/// `2: eth0    inet 192.168.1.10/24 brd ... scope global eth0`
pub fn parse_interface_addresses(output: &str) -> HashSet<IpAddr> {
    let mut addrs = HashSet::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" || field == "inet6" {
                if let Some(cidr) = fields.next() {
                    if let Some((addr, _)) = cidr.split_once('/') {
                        if let Ok(ip) = addr.parse::<IpAddr>() {
                            addrs.insert(ip);
                        }
                    }
                }
                break;
            }
        }
    }
    addrs
}

/// Parse the owning process out of one `ss -Hlptn` line.
///
/// The process column looks like: `users:(("nginx",pid=1234,fd=6))`.
pub fn parse_socket_owner(line: &str) -> Option<(String, i32)> {
    let users = line.split("users:((").nth(1)?;
    let name = users.split('"').nth(1)?.to_string();
    let pid_part = users.split("pid=").nth(1)?;
    let pid: i32 = pid_part
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some((name, pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_interface_addresses() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
1: lo    inet6 ::1/128 scope host \\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global dynamic eth0\\       valid_lft 86000sec
";
        let addrs = parse_interface_addresses(output);
        assert!(addrs.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(addrs.contains(&"::1".parse::<IpAddr>().unwrap()));
        assert!(addrs.contains(&"192.168.1.10".parse::<IpAddr>().unwrap()));
        assert_eq!(addrs.len(), 3);
    }

    #[test]
    fn test_parse_interface_addresses_empty() {
        assert!(parse_interface_addresses("").is_empty());
    }

    #[test]
    fn test_parse_socket_owner() {
        let line = r#"LISTEN 0      511          0.0.0.0:80        0.0.0.0:*    users:(("nginx",pid=1234,fd=6),("nginx",pid=1235,fd=6))"#;
        let (name, pid) = parse_socket_owner(line).unwrap();
        assert_eq!(name, "nginx");
        assert_eq!(pid, 1234);
    }

    #[test]
    fn test_parse_socket_owner_no_process_column() {
        let line = "LISTEN 0 511 0.0.0.0:80 0.0.0.0:*";
        assert!(parse_socket_owner(line).is_none());
    }

    #[test]
    fn test_parse_socket_owner_garbage() {
        assert!(parse_socket_owner("users:((broken").is_none());
    }
}
