//! Network-state engine.
//!
//! Owns the authoritative view of allocated loopback addresses, hosts-file
//! entries, and session resource ownership, and executes the operation set
//! against the OS. All mutable state sits behind one async mutex; every
//! operation and every cleanup serializes through it, so a cleanup
//! triggered while an operation for the same session is in flight simply
//! waits for it to finish.

pub mod hosts;
pub mod inspect;
pub mod ip_pool;
pub mod ports;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::elevation::{self, ElevationRequest, PrivilegeProbe};
use crate::ipc::envelope::ErrorCode;
use crate::ipc::types::{
    AddHostsEntriesArgs, AllocateIpArgs, EndpointAllocation, FreeIpArgs, Operation,
    OperationResult,
};
use hosts::{HostsError, HostsFile};
use inspect::{HostNetwork, OsError};
use ip_pool::LoopbackPool;
use session::{SessionId, SessionState};

pub use inspect::{PortOwner, SystemNetwork};

/// Errors from executing an operation. Always rendered into a structured
/// response, never allowed to tear down the connection.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("elevated privileges required for {op}")]
    ElevationRequired {
        op: &'static str,
        request: Option<ElevationRequest>,
    },

    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error(transparent)]
    Os(#[from] OsError),

    #[error(transparent)]
    Hosts(#[from] HostsError),
}

impl OpError {
    /// The wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            OpError::ElevationRequired { .. } => ErrorCode::ElevationRequired,
            OpError::Conflict(_) | OpError::UnknownSession(_) => ErrorCode::ResourceConflict,
            OpError::Os(_) | OpError::Hosts(_) => ErrorCode::OsOperationFailed,
        }
    }

    /// The elevation request to surface upstream, if any.
    pub fn elevation(&self) -> Option<ElevationRequest> {
        match self {
            OpError::ElevationRequired { request, .. } => request.clone(),
            _ => None,
        }
    }
}

/// One endpoint's active address assignment.
#[derive(Debug, Clone)]
struct Allocation {
    ip: Ipv4Addr,
    session: SessionId,
    created_at: SystemTime,
}

#[derive(Debug, Default)]
struct SessionRecord {
    state: SessionState,
    ips: Vec<Ipv4Addr>,
    owns_hosts_entries: bool,
}

struct Inner {
    pool: LoopbackPool,
    /// Endpoint key → active allocation. At most one per key.
    allocations: HashMap<String, Allocation>,
    sessions: HashMap<SessionId, SessionRecord>,
    next_session: u64,
}

/// The daemon-side network-state engine.
pub struct NetState {
    host: Arc<dyn HostNetwork>,
    probe: Arc<dyn PrivilegeProbe>,
    hosts: HostsFile,
    process_wait: Duration,
    service_wait: Duration,
    inner: Mutex<Inner>,
}

impl NetState {
    /// Build an engine over the given pool range and hosts file.
    pub fn new(
        pool_net: Ipv4Net,
        hosts: HostsFile,
        process_wait: Duration,
        service_wait: Duration,
        host: Arc<dyn HostNetwork>,
        probe: Arc<dyn PrivilegeProbe>,
    ) -> Self {
        Self {
            host,
            probe,
            hosts,
            process_wait,
            service_wait,
            inner: Mutex::new(Inner {
                pool: LoopbackPool::new(pool_net),
                allocations: HashMap::new(),
                sessions: HashMap::new(),
                next_session: 1,
            }),
        }
    }

    /// Build an engine from application configuration.
    pub fn from_config(
        config: &loopbridge_config::AppConfig,
        host: Arc<dyn HostNetwork>,
        probe: Arc<dyn PrivilegeProbe>,
    ) -> Result<Self, loopbridge_config::ConfigError> {
        Ok(Self::new(
            config.pool_net()?,
            HostsFile::new(&config.hosts.path),
            config.timeouts.process_exit(),
            config.timeouts.service_stop(),
            host,
            probe,
        ))
    }

    /// Register a new session for an accepted connection.
    pub async fn open_session(&self) -> SessionId {
        let mut inner = self.inner.lock().await;
        let id = SessionId(inner.next_session);
        inner.next_session += 1;
        inner.sessions.insert(id, SessionRecord::default());
        debug!(session = %id, "session opened");
        id
    }

    /// Current lifecycle state of `session`, if it is still tracked.
    pub async fn session_state(&self, session: SessionId) -> Option<SessionState> {
        self.inner
            .lock()
            .await
            .sessions
            .get(&session)
            .map(|rec| rec.state)
    }

    /// Execute one operation on behalf of `session`.
    ///
    /// The elevation check runs before anything touches the OS; an
    /// unprivileged daemon refuses the mutation outright.
    pub async fn execute(
        &self,
        session: SessionId,
        op: &Operation,
    ) -> Result<OperationResult, OpError> {
        if let Err(request) = elevation::check(self.probe.as_ref(), op) {
            return Err(OpError::ElevationRequired {
                op: op.name(),
                request,
            });
        }

        let mut inner = self.inner.lock().await;
        let state = inner
            .sessions
            .get(&session)
            .ok_or(OpError::UnknownSession(session))?
            .state;
        if state == SessionState::Cleaning || state.is_terminal() {
            return Err(OpError::Conflict(format!("{session} is shutting down")));
        }

        match op {
            Operation::AllocateIp(args) => self.allocate_ip(&mut inner, session, args).await,
            Operation::FreeIp(args) => self.free_ip(&mut inner, session, args).await,
            Operation::AddHostsEntries(args) => self.add_hosts(&mut inner, session, args).await,
            Operation::KillProcess(args) => {
                let mut outcomes = Vec::with_capacity(args.targets.len());
                for target in &args.targets {
                    outcomes.push(
                        ports::free_port(
                            self.host.as_ref(),
                            target.port,
                            self.process_wait,
                            self.service_wait,
                        )
                        .await,
                    );
                }
                Ok(OperationResult::TargetOutcomes(outcomes))
            }
            Operation::DisableService(args) => {
                let mut outcomes = Vec::with_capacity(args.targets.len());
                for target in &args.targets {
                    outcomes.push(
                        ports::free_port(
                            self.host.as_ref(),
                            target.port,
                            self.process_wait,
                            self.service_wait,
                        )
                        .await,
                    );
                }
                Ok(OperationResult::TargetOutcomes(outcomes))
            }
        }
    }

    /// Release every resource `session` owns.
    ///
    /// Idempotent: cleaning an already-clean or unknown session is a no-op.
    /// Serializes behind the state lock, so an in-flight operation for the
    /// same session finishes first.
    pub async fn cleanup(&self, session: SessionId) -> Result<(), OpError> {
        let mut inner = self.inner.lock().await;
        let Some(rec) = inner.sessions.get_mut(&session) else {
            return Ok(());
        };
        match rec.state.transition_to(SessionState::Cleaning) {
            Ok(next) => rec.state = next,
            // Already cleaning or closed: nothing left to do.
            Err(_) => return Ok(()),
        }
        let ips = rec.ips.clone();
        let owns_hosts = rec.owns_hosts_entries;

        for ip in &ips {
            if let Err(e) = self.host.remove_loopback_alias(*ip).await {
                warn!(ip = %ip, error = %e, "failed to remove loopback alias during cleanup");
            }
        }
        inner.allocations.retain(|_, alloc| alloc.session != session);

        if owns_hosts {
            if let Err(e) = self.hosts.remove_entries(&session.to_string()).await {
                // Leave the session retryable; the hosts file still holds
                // its block.
                if let Some(rec) = inner.sessions.get_mut(&session) {
                    if let Ok(next) = rec.state.transition_to(SessionState::Active) {
                        rec.state = next;
                    }
                    rec.ips.clear();
                }
                return Err(e.into());
            }
        }

        inner.sessions.remove(&session);
        info!(session = %session, freed_ips = ips.len(), "session resources released");
        Ok(())
    }

    async fn allocate_ip(
        &self,
        inner: &mut Inner,
        session: SessionId,
        args: &AllocateIpArgs,
    ) -> Result<OperationResult, OpError> {
        begin_mutation(inner, session)?;

        let iface = match self.host.interface_addresses().await {
            Ok(set) => set,
            Err(e) => {
                settle(inner, session);
                return Err(e.into());
            }
        };

        // Everything already spoken for: the allocation table plus live
        // interface state, snapshotted once for this batch.
        let mut in_use: HashSet<Ipv4Addr> =
            inner.allocations.values().map(|a| a.ip).collect();
        in_use.extend(iface.iter().filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        }));

        let mut results = Vec::with_capacity(args.endpoints.len());
        let mut newly: Vec<(String, Ipv4Addr)> = Vec::new();

        for endpoint in &args.endpoints {
            let key = endpoint.key();

            if let Some(existing) = inner.allocations.get(&key) {
                if existing.session == session {
                    results.push(EndpointAllocation {
                        endpoint: endpoint.clone(),
                        ip: existing.ip,
                    });
                    continue;
                }
                let holder = existing.session;
                self.rollback_batch(inner, session, &newly).await;
                settle(inner, session);
                return Err(OpError::Conflict(format!(
                    "endpoint {key} is already redirected by {holder}"
                )));
            }

            let Some(ip) = inner.pool.allocate(|c| in_use.contains(&c)) else {
                self.rollback_batch(inner, session, &newly).await;
                settle(inner, session);
                return Err(OpError::Conflict(
                    "loopback address pool exhausted".to_string(),
                ));
            };

            if let Err(e) = self.host.add_loopback_alias(ip).await {
                self.rollback_batch(inner, session, &newly).await;
                settle(inner, session);
                return Err(e.into());
            }

            in_use.insert(ip);
            inner.allocations.insert(
                key.clone(),
                Allocation {
                    ip,
                    session,
                    created_at: SystemTime::now(),
                },
            );
            if let Some(rec) = inner.sessions.get_mut(&session) {
                rec.ips.push(ip);
            }
            newly.push((key, ip));
            results.push(EndpointAllocation {
                endpoint: endpoint.clone(),
                ip,
            });
        }

        settle(inner, session);
        info!(session = %session, count = results.len(), "loopback addresses allocated");
        Ok(OperationResult::Allocations(results))
    }

    async fn free_ip(
        &self,
        inner: &mut Inner,
        session: SessionId,
        args: &FreeIpArgs,
    ) -> Result<OperationResult, OpError> {
        for ip in &args.addresses {
            let owner = inner
                .allocations
                .iter()
                .find(|(_, a)| a.ip == *ip)
                .map(|(key, a)| (key.clone(), a.session, a.created_at));
            match owner {
                // Not allocated: freeing is trivially done.
                None => continue,
                Some((_, holder, _)) if holder != session => {
                    return Err(OpError::Conflict(format!(
                        "address {ip} is held by {holder}"
                    )));
                }
                Some((key, _, created_at)) => {
                    inner.allocations.remove(&key);
                    if let Some(rec) = inner.sessions.get_mut(&session) {
                        rec.ips.retain(|i| i != ip);
                    }
                    if let Err(e) = self.host.remove_loopback_alias(*ip).await {
                        // The table, not the interface, decides reuse.
                        warn!(ip = %ip, error = %e, "failed to remove loopback alias");
                    }
                    let held_secs = created_at.elapsed().map(|d| d.as_secs()).unwrap_or(0);
                    debug!(session = %session, ip = %ip, held_secs, "address freed");
                }
            }
        }
        Ok(OperationResult::Ack)
    }

    async fn add_hosts(
        &self,
        inner: &mut Inner,
        session: SessionId,
        args: &AddHostsEntriesArgs,
    ) -> Result<OperationResult, OpError> {
        begin_mutation(inner, session)?;

        let entries: Vec<_> = args
            .entries
            .iter()
            .filter(|e| !e.hostnames.is_empty())
            .cloned()
            .collect();

        let result = self
            .hosts
            .add_entries(&session.to_string(), &args.namespace, &entries)
            .await;

        match result {
            Ok(()) => {
                if !entries.is_empty() {
                    if let Some(rec) = inner.sessions.get_mut(&session) {
                        rec.owns_hosts_entries = true;
                    }
                }
                settle(inner, session);
                info!(session = %session, count = entries.len(), "hosts entries added");
                Ok(OperationResult::Ack)
            }
            Err(e) => {
                settle(inner, session);
                Err(e.into())
            }
        }
    }

    async fn rollback_batch(
        &self,
        inner: &mut Inner,
        session: SessionId,
        newly: &[(String, Ipv4Addr)],
    ) {
        for (key, ip) in newly {
            inner.allocations.remove(key);
            if let Some(rec) = inner.sessions.get_mut(&session) {
                rec.ips.retain(|i| i != ip);
            }
            if let Err(e) = self.host.remove_loopback_alias(*ip).await {
                warn!(ip = %ip, error = %e, "failed to remove loopback alias during rollback");
            }
        }
    }
}

fn begin_mutation(inner: &mut Inner, session: SessionId) -> Result<(), OpError> {
    let rec = inner
        .sessions
        .get_mut(&session)
        .ok_or(OpError::UnknownSession(session))?;
    match rec.state.transition_to(SessionState::Allocating) {
        Ok(next) => {
            rec.state = next;
            Ok(())
        }
        Err((from, _)) => Err(OpError::Conflict(format!(
            "{session} cannot mutate while {from}"
        ))),
    }
}

fn settle(inner: &mut Inner, session: SessionId) {
    if let Some(rec) = inner.sessions.get_mut(&session) {
        let target = if rec.ips.is_empty() && !rec.owns_hosts_entries {
            SessionState::Idle
        } else {
            SessionState::Active
        };
        if let Ok(next) = rec.state.transition_to(target) {
            rec.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::FixedProbe;
    use crate::ipc::types::{
        EndpointDescriptor, HostsEntrySpec, KillProcessArgs, ProcessTarget,
    };
    use crate::testing::FakeHost;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const HOSTS_BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

    struct Fixture {
        state: NetState,
        host: Arc<FakeHost>,
        hosts_path: std::path::PathBuf,
        _tmp: TempDir,
    }

    async fn fixture(elevated: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let hosts_path = tmp.path().join("hosts");
        tokio::fs::write(&hosts_path, HOSTS_BASE).await.unwrap();

        let host = FakeHost::new();
        let state = NetState::new(
            "127.1.1.0/29".parse().unwrap(),
            HostsFile::new(&hosts_path),
            Duration::from_millis(50),
            Duration::from_millis(50),
            host.clone(),
            Arc::new(FixedProbe(elevated)),
        );
        Fixture {
            state,
            host,
            hosts_path,
            _tmp: tmp,
        }
    }

    fn allocate(endpoints: Vec<EndpointDescriptor>) -> Operation {
        Operation::AllocateIp(AllocateIpArgs { endpoints })
    }

    #[tokio::test]
    async fn test_allocate_assigns_distinct_ips() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        let result = fx
            .state
            .execute(
                session,
                &allocate(vec![
                    EndpointDescriptor::service("svc-a", "ns1"),
                    EndpointDescriptor::service("svc-b", "ns1"),
                ]),
            )
            .await
            .unwrap();

        let OperationResult::Allocations(allocs) = result else {
            panic!("expected allocations");
        };
        assert_eq!(allocs.len(), 2);
        assert_ne!(allocs[0].ip, allocs[1].ip);
        assert_eq!(fx.host.aliases().len(), 2);
        assert_eq!(
            fx.state.session_state(session).await,
            Some(SessionState::Active)
        );
    }

    #[tokio::test]
    async fn test_allocate_skips_interface_addresses() {
        let fx = fixture(true).await;
        fx.host.add_interface_addr("127.1.1.1".parse().unwrap());
        let session = fx.state.open_session().await;

        let result = fx
            .state
            .execute(session, &allocate(vec![EndpointDescriptor::service("svc-a", "ns1")]))
            .await
            .unwrap();

        let OperationResult::Allocations(allocs) = result else {
            panic!("expected allocations");
        };
        assert_eq!(allocs[0].ip, "127.1.1.2".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_allocate_same_endpoint_reuses_assignment() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;
        let ep = EndpointDescriptor::service("svc-a", "ns1");

        let first = fx
            .state
            .execute(session, &allocate(vec![ep.clone()]))
            .await
            .unwrap();
        let second = fx
            .state
            .execute(session, &allocate(vec![ep]))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.host.aliases().len(), 1);
    }

    #[tokio::test]
    async fn test_allocate_conflicts_across_sessions() {
        let fx = fixture(true).await;
        let s1 = fx.state.open_session().await;
        let s2 = fx.state.open_session().await;
        let ep = EndpointDescriptor::service("svc-a", "ns1");

        fx.state
            .execute(s1, &allocate(vec![ep.clone()]))
            .await
            .unwrap();
        let err = fx.state.execute(s2, &allocate(vec![ep])).await.unwrap_err();
        assert!(matches!(err, OpError::Conflict(_)));
        assert_eq!(err.code(), ErrorCode::ResourceConflict);
    }

    #[tokio::test]
    async fn test_free_then_reallocate_may_reuse() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        // Exhaust the /29 pool (6 hosts).
        let endpoints: Vec<_> = (0..6)
            .map(|i| EndpointDescriptor::service(&format!("svc-{i}"), "ns1"))
            .collect();
        let result = fx
            .state
            .execute(session, &allocate(endpoints))
            .await
            .unwrap();
        let OperationResult::Allocations(allocs) = result else {
            panic!("expected allocations");
        };
        let freed = allocs[0].ip;

        // Pool is full now.
        let err = fx
            .state
            .execute(
                session,
                &allocate(vec![EndpointDescriptor::service("svc-z", "ns1")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Conflict(_)));

        // Freeing returns the slot immediately.
        fx.state
            .execute(
                session,
                &Operation::FreeIp(FreeIpArgs {
                    addresses: vec![freed],
                }),
            )
            .await
            .unwrap();
        let result = fx
            .state
            .execute(
                session,
                &allocate(vec![EndpointDescriptor::service("svc-z", "ns1")]),
            )
            .await
            .unwrap();
        let OperationResult::Allocations(allocs) = result else {
            panic!("expected allocations");
        };
        assert_eq!(allocs[0].ip, freed);
    }

    #[tokio::test]
    async fn test_free_unallocated_address_is_noop() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;
        let result = fx
            .state
            .execute(
                session,
                &Operation::FreeIp(FreeIpArgs {
                    addresses: vec!["127.1.1.5".parse().unwrap()],
                }),
            )
            .await
            .unwrap();
        assert_eq!(result, OperationResult::Ack);
    }

    #[tokio::test]
    async fn test_free_foreign_address_conflicts() {
        let fx = fixture(true).await;
        let s1 = fx.state.open_session().await;
        let s2 = fx.state.open_session().await;

        let result = fx
            .state
            .execute(s1, &allocate(vec![EndpointDescriptor::service("svc-a", "ns1")]))
            .await
            .unwrap();
        let OperationResult::Allocations(allocs) = result else {
            panic!("expected allocations");
        };

        let err = fx
            .state
            .execute(
                s2,
                &Operation::FreeIp(FreeIpArgs {
                    addresses: vec![allocs[0].ip],
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unprivileged_hosts_edit_refused_without_mutation() {
        let fx = fixture(false).await;
        let session = fx.state.open_session().await;

        let err = fx
            .state
            .execute(
                session,
                &Operation::AddHostsEntries(AddHostsEntriesArgs {
                    namespace: "ns1".into(),
                    entries: vec![HostsEntrySpec {
                        ip: "127.1.1.1".parse().unwrap(),
                        hostnames: vec!["svc-a".into()],
                    }],
                }),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ElevationRequired);
        assert_eq!(err.elevation(), Some(ElevationRequest::EditHostsFile));

        // Nothing touched the file.
        let contents = tokio::fs::read_to_string(&fx.hosts_path).await.unwrap();
        assert_eq!(contents, HOSTS_BASE);
    }

    #[tokio::test]
    async fn test_cleanup_releases_everything_and_is_idempotent() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        fx.state
            .execute(session, &allocate(vec![EndpointDescriptor::service("svc-a", "ns1")]))
            .await
            .unwrap();
        fx.state
            .execute(
                session,
                &Operation::AddHostsEntries(AddHostsEntriesArgs {
                    namespace: "ns1".into(),
                    entries: vec![HostsEntrySpec {
                        ip: "127.1.1.1".parse().unwrap(),
                        hostnames: vec!["svc-a".into(), "svc-a.ns1".into()],
                    }],
                }),
            )
            .await
            .unwrap();

        fx.state.cleanup(session).await.unwrap();

        assert!(fx.host.aliases().is_empty());
        let contents = tokio::fs::read_to_string(&fx.hosts_path).await.unwrap();
        assert_eq!(contents, HOSTS_BASE);
        assert_eq!(fx.state.session_state(session).await, None);

        // Second cleanup: no-op, never an error.
        fx.state.cleanup(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_preserves_foreign_hosts_lines() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        // Another actor's line, present before the session mutates.
        let pre = format!("{HOSTS_BASE}192.168.0.7 printer.lan\n");
        tokio::fs::write(&fx.hosts_path, &pre).await.unwrap();

        fx.state
            .execute(
                session,
                &Operation::AddHostsEntries(AddHostsEntriesArgs {
                    namespace: "ns1".into(),
                    entries: vec![HostsEntrySpec {
                        ip: "127.1.1.1".parse().unwrap(),
                        hostnames: vec!["svc-a".into()],
                    }],
                }),
            )
            .await
            .unwrap();
        fx.state.cleanup(session).await.unwrap();

        let contents = tokio::fs::read_to_string(&fx.hosts_path).await.unwrap();
        assert_eq!(contents, pre);
    }

    #[tokio::test]
    async fn test_kill_process_on_free_port_succeeds_trivially() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        let result = fx
            .state
            .execute(
                session,
                &Operation::KillProcess(KillProcessArgs {
                    targets: vec![ProcessTarget { pid: 42, port: 8080 }],
                }),
            )
            .await
            .unwrap();

        let OperationResult::TargetOutcomes(outcomes) = result else {
            panic!("expected outcomes");
        };
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded);
        assert!(fx.host.signals().is_empty());
    }

    #[tokio::test]
    async fn test_kill_process_routes_service_owner_to_service_stop() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        fx.host.add_unit("nginx.service", true);
        fx.host.set_port_owner(
            80,
            PortOwner::Service {
                pid: 51,
                unit: "nginx.service".into(),
            },
        );

        let result = fx
            .state
            .execute(
                session,
                &Operation::KillProcess(KillProcessArgs {
                    targets: vec![ProcessTarget { pid: 51, port: 80 }],
                }),
            )
            .await
            .unwrap();

        let OperationResult::TargetOutcomes(outcomes) = result else {
            panic!("expected outcomes");
        };
        assert!(outcomes[0].succeeded);
        assert_eq!(fx.host.stopped_units(), vec!["nginx.service".to_string()]);
        assert!(fx.host.signals().is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_reported_per_item() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        fx.host.add_process(100, true);
        fx.host.set_port_owner(
            8080,
            PortOwner::Process {
                pid: 100,
                name: "ok-proc".into(),
            },
        );
        fx.host.add_immortal_process(200);
        fx.host.set_port_owner(
            9090,
            PortOwner::Process {
                pid: 200,
                name: "immortal".into(),
            },
        );

        let result = fx
            .state
            .execute(
                session,
                &Operation::KillProcess(KillProcessArgs {
                    targets: vec![
                        ProcessTarget { pid: 100, port: 8080 },
                        ProcessTarget { pid: 200, port: 9090 },
                    ],
                }),
            )
            .await
            .unwrap();

        let OperationResult::TargetOutcomes(outcomes) = result else {
            panic!("expected outcomes");
        };
        assert!(outcomes[0].succeeded);
        assert!(!outcomes[1].succeeded);
    }

    #[tokio::test]
    async fn test_execute_on_unknown_session() {
        let fx = fixture(true).await;
        let err = fx
            .state
            .execute(SessionId(999), &allocate(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_rolls_back_batch() {
        let fx = fixture(true).await;
        let session = fx.state.open_session().await;

        // Seven endpoints into a six-host pool: the whole batch fails.
        let endpoints: Vec<_> = (0..7)
            .map(|i| EndpointDescriptor::service(&format!("svc-{i}"), "ns1"))
            .collect();
        let err = fx
            .state
            .execute(session, &allocate(endpoints))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Conflict(_)));

        // Rollback removed the partial allocations and their aliases.
        assert!(fx.host.aliases().is_empty());
        assert_eq!(
            fx.state.session_state(session).await,
            Some(SessionState::Idle)
        );
    }
}
