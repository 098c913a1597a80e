//! The closed operation set and its argument/result shapes.
//!
//! Every operation the daemon can perform is a variant of [`Operation`];
//! dispatch matches exhaustively, so adding an operation is a compile-time
//! exercise. Argument payloads are strict (`deny_unknown_fields`) so a
//! request is validated structurally before anything touches the OS.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A logical remote endpoint that needs a local loopback address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDescriptor {
    /// Service name, or a bare external hostname.
    pub name: String,

    /// Workload namespace; absent for external hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl EndpointDescriptor {
    /// A cluster service endpoint.
    pub fn service(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        }
    }

    /// An external host endpoint.
    pub fn external(host: &str) -> Self {
        Self {
            name: host.to_string(),
            namespace: None,
        }
    }

    /// Stable key identifying this endpoint in the allocation table.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{ns}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One hosts-file line to add: an address and the names that resolve to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsEntrySpec {
    pub ip: Ipv4Addr,
    pub hostnames: Vec<String>,
}

/// A process currently squatting on a port the workflow needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessTarget {
    pub pid: i32,
    pub port: u16,
}

/// An OS-managed service currently bound to a port the workflow needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceTarget {
    pub service: String,
    pub port: u16,
}

/// Arguments for [`Operation::AllocateIp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocateIpArgs {
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Arguments for [`Operation::FreeIp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreeIpArgs {
    pub addresses: Vec<Ipv4Addr>,
}

/// Arguments for [`Operation::AddHostsEntries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddHostsEntriesArgs {
    /// Workload namespace the entries belong to; recorded in the block tag.
    pub namespace: String,
    pub entries: Vec<HostsEntrySpec>,
}

/// Arguments for [`Operation::KillProcess`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KillProcessArgs {
    pub targets: Vec<ProcessTarget>,
}

/// Arguments for [`Operation::DisableService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisableServiceArgs {
    pub targets: Vec<ServiceTarget>,
}

/// The closed set of daemon operations. All of them mutate privileged OS
/// state and are subject to the elevation check before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Operation {
    /// Assign a loopback address to each endpoint.
    AllocateIp(AllocateIpArgs),
    /// Release previously allocated loopback addresses.
    FreeIp(FreeIpArgs),
    /// Append session-tagged entries to the hosts file.
    AddHostsEntries(AddHostsEntriesArgs),
    /// Free ports held by user processes.
    KillProcess(KillProcessArgs),
    /// Free ports held by OS-managed services.
    DisableService(DisableServiceArgs),
}

impl Operation {
    /// Wire names of every operation, in declaration order. The decoder
    /// uses this to tell an unknown operation from a malformed payload.
    pub const NAMES: [&'static str; 5] = [
        "allocate_ip",
        "free_ip",
        "add_hosts_entries",
        "kill_process",
        "disable_service",
    ];

    /// The wire name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AllocateIp(_) => "allocate_ip",
            Operation::FreeIp(_) => "free_ip",
            Operation::AddHostsEntries(_) => "add_hosts_entries",
            Operation::KillProcess(_) => "kill_process",
            Operation::DisableService(_) => "disable_service",
        }
    }
}

/// One endpoint → address assignment from [`Operation::AllocateIp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAllocation {
    pub endpoint: EndpointDescriptor,
    pub ip: Ipv4Addr,
}

/// Per-target outcome for the port-freeing operations. Batch failures are
/// reported item by item so the caller can decide whether to proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub port: u16,
    pub succeeded: bool,

    /// Failure or disposition detail ("already free", "stopped unit nginx.service").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TargetOutcome {
    pub fn ok(port: u16, detail: impl Into<String>) -> Self {
        Self {
            port,
            succeeded: true,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(port: u16, detail: impl Into<String>) -> Self {
        Self {
            port,
            succeeded: false,
            detail: Some(detail.into()),
        }
    }
}

/// Successful result payload, one variant per operation family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OperationResult {
    /// Endpoint → address mapping from `allocate_ip`.
    Allocations(Vec<EndpointAllocation>),
    /// Plain acknowledgement for `free_ip` / `add_hosts_entries`.
    Ack,
    /// Per-item outcomes for `kill_process` / `disable_service`.
    TargetOutcomes(Vec<TargetOutcome>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_endpoint_key() {
        let svc = EndpointDescriptor::service("svc-a", "ns1");
        assert_eq!(svc.key(), "svc-a.ns1");

        let ext = EndpointDescriptor::external("db.example.com");
        assert_eq!(ext.key(), "db.example.com");
    }

    #[test]
    fn test_operation_wire_shape() {
        let op = Operation::AllocateIp(AllocateIpArgs {
            endpoints: vec![EndpointDescriptor::service("svc-a", "ns1")],
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "allocate_ip");
        assert_eq!(json["args"]["endpoints"][0]["name"], "svc-a");
        assert_eq!(json["args"]["endpoints"][0]["namespace"], "ns1");
    }

    #[test]
    fn test_operation_names_cover_all_variants() {
        let ops = [
            Operation::AllocateIp(AllocateIpArgs { endpoints: vec![] }),
            Operation::FreeIp(FreeIpArgs { addresses: vec![] }),
            Operation::AddHostsEntries(AddHostsEntriesArgs {
                namespace: "ns".into(),
                entries: vec![],
            }),
            Operation::KillProcess(KillProcessArgs { targets: vec![] }),
            Operation::DisableService(DisableServiceArgs { targets: vec![] }),
        ];
        for op in &ops {
            assert!(Operation::NAMES.contains(&op.name()));
        }
    }

    #[test]
    fn test_extra_argument_fields_rejected() {
        let json = r#"{
            "op": "free_ip",
            "args": { "addresses": ["127.1.1.5"], "force": true }
        }"#;
        let result: Result<Operation, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_external_endpoint_omits_namespace_on_wire() {
        let ext = EndpointDescriptor::external("db.example.com");
        let json = serde_json::to_value(&ext).unwrap();
        assert!(json.get("namespace").is_none());
    }

    #[test]
    fn test_target_outcome_constructors() {
        let ok = TargetOutcome::ok(8080, "already free");
        assert!(ok.succeeded);
        assert_eq!(ok.detail.as_deref(), Some("already free"));

        let bad = TargetOutcome::failed(443, "timed out");
        assert!(!bad.succeeded);
    }
}
