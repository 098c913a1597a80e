//! Privilege probing and the elevation-request contract.
//!
//! Every operation in the registry mutates privileged OS state. Before the
//! daemon executes one it probes its own effective privilege; when that is
//! insufficient it refuses the mutation and hands back a structured
//! [`ElevationRequest`] for the CLI layer to turn into a user prompt. The
//! daemon never retries and never escalates on its own.

use serde::{Deserialize, Serialize};

use crate::ipc::types::Operation;

/// What kind of thing holds the port the user is being asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortTargetType {
    Process,
    Service,
}

/// The closed contract between the daemon and any layer that prompts the
/// user for elevated execution. Adding a kind is additive; existing wire
/// shapes never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElevationRequest {
    /// Freeing ports held by another process or service.
    FreePort {
        ports: Vec<u16>,
        target_type: PortTargetType,
    },
    /// Editing the hosts file.
    EditHostsFile,
}

/// Seam for probing the current process's privilege, so tests can run the
/// refusal path without dropping privileges.
pub trait PrivilegeProbe: Send + Sync {
    fn is_elevated(&self) -> bool;
}

/// Probes the effective uid of the running process.
#[derive(Debug, Default)]
pub struct EuidProbe;

impl PrivilegeProbe for EuidProbe {
    fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Fixed-answer probe for tests.
#[derive(Debug)]
pub struct FixedProbe(pub bool);

impl PrivilegeProbe for FixedProbe {
    fn is_elevated(&self) -> bool {
        self.0
    }
}

/// The elevation request an unprivileged daemon would need to execute `op`.
///
/// Address-pool operations have no prompt variant of their own: the
/// daemon process itself must already be elevated to manage loopback
/// aliases, so the caller is told to relaunch it rather than prompted for
/// a specific resource.
pub fn required_request(op: &Operation) -> Option<ElevationRequest> {
    match op {
        Operation::AddHostsEntries(_) => Some(ElevationRequest::EditHostsFile),
        Operation::KillProcess(args) => Some(ElevationRequest::FreePort {
            ports: args.targets.iter().map(|t| t.port).collect(),
            target_type: PortTargetType::Process,
        }),
        Operation::DisableService(args) => Some(ElevationRequest::FreePort {
            ports: args.targets.iter().map(|t| t.port).collect(),
            target_type: PortTargetType::Service,
        }),
        Operation::AllocateIp(_) | Operation::FreeIp(_) => None,
    }
}

/// Check `probe` against `op`. `Ok(())` means execution may proceed;
/// `Err` carries the request to surface upstream (absent for operations
/// without a prompt variant).
pub fn check(probe: &dyn PrivilegeProbe, op: &Operation) -> Result<(), Option<ElevationRequest>> {
    if probe.is_elevated() {
        Ok(())
    } else {
        Err(required_request(op))
    }
}
