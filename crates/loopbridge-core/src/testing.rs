//! Scripted fake of the OS seam.
//!
//! [`FakeHost`] stands in for the system's network and service tooling in
//! tests: interface addresses, port owners, process liveness, and unit
//! state are all set up by the test and mutated by the code under test
//! through the same trait the real backend implements.
//!
//! This module is compiled for the crate's own tests and, for downstream
//! crates, behind the `testing` feature; `loopbridge-test-utils` re-exports
//! it so the fake has a single definition across the workspace.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::BoxFuture;
use crate::netstate::inspect::{HostNetwork, OsError, PortOwner};

#[derive(Default)]
struct FakeState {
    interface_addrs: HashSet<IpAddr>,
    aliases: Vec<Ipv4Addr>,
    port_owners: HashMap<u16, PortOwner>,
    alive: HashSet<i32>,
    term_responsive: HashSet<i32>,
    immortal: HashSet<i32>,
    active_units: HashSet<String>,
    wedged_units: HashSet<String>,
    signals: Vec<(i32, Signal)>,
    stopped_units: Vec<String>,
    fail_alias_ops: bool,
}

impl FakeState {
    fn mark_dead(&mut self, pid: i32) {
        self.alive.remove(&pid);
        self.port_owners
            .retain(|_, owner| !matches!(owner, PortOwner::Process { pid: p, .. } if *p == pid));
    }
}

/// In-memory [`HostNetwork`] with scripted processes, units, and ports.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend `ip` is already assigned to some host interface.
    pub fn add_interface_addr(&self, ip: IpAddr) {
        self.lock().interface_addrs.insert(ip);
    }

    /// Script the current owner of `port`.
    pub fn set_port_owner(&self, port: u16, owner: PortOwner) {
        self.lock().port_owners.insert(port, owner);
    }

    /// Script a live process. When `responds_to_term` is false it survives
    /// SIGTERM and dies only on SIGKILL.
    pub fn add_process(&self, pid: i32, responds_to_term: bool) {
        let mut state = self.lock();
        state.alive.insert(pid);
        if responds_to_term {
            state.term_responsive.insert(pid);
        }
    }

    /// Script a process that survives every signal, for timeout paths.
    pub fn add_immortal_process(&self, pid: i32) {
        let mut state = self.lock();
        state.alive.insert(pid);
        state.immortal.insert(pid);
    }

    /// Script an active unit. When `stops_cleanly` is false it stays
    /// active after a stop request, for timeout paths.
    pub fn add_unit(&self, unit: &str, stops_cleanly: bool) {
        let mut state = self.lock();
        state.active_units.insert(unit.to_string());
        if !stops_cleanly {
            state.wedged_units.insert(unit.to_string());
        }
    }

    /// Make loopback alias add/remove fail from now on.
    pub fn fail_alias_ops(&self) {
        self.lock().fail_alias_ops = true;
    }

    /// Aliases currently added and not removed.
    pub fn aliases(&self) -> Vec<Ipv4Addr> {
        self.lock().aliases.clone()
    }

    /// Every signal delivered, in order.
    pub fn signals(&self) -> Vec<(i32, Signal)> {
        self.lock().signals.clone()
    }

    /// Every unit asked to stop, in order.
    pub fn stopped_units(&self) -> Vec<String> {
        self.lock().stopped_units.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake host state poisoned")
    }
}

impl HostNetwork for FakeHost {
    fn interface_addresses(&self) -> BoxFuture<'_, Result<HashSet<IpAddr>, OsError>> {
        let addrs = self.lock().interface_addrs.clone();
        Box::pin(async move { Ok(addrs) })
    }

    fn add_loopback_alias(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), OsError>> {
        let result = {
            let mut state = self.lock();
            if state.fail_alias_ops {
                Err(OsError::CommandFailed {
                    command: format!("ip addr add {ip}/32 dev lo"),
                    status: 2,
                    stderr: "RTNETLINK answers: Operation not permitted".to_string(),
                })
            } else {
                state.aliases.push(ip);
                state.interface_addrs.insert(IpAddr::V4(ip));
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn remove_loopback_alias(&self, ip: Ipv4Addr) -> BoxFuture<'_, Result<(), OsError>> {
        let result = {
            let mut state = self.lock();
            if state.fail_alias_ops {
                Err(OsError::CommandFailed {
                    command: format!("ip addr del {ip}/32 dev lo"),
                    status: 2,
                    stderr: "RTNETLINK answers: Operation not permitted".to_string(),
                })
            } else {
                state.aliases.retain(|a| *a != ip);
                state.interface_addrs.remove(&IpAddr::V4(ip));
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn port_owner(&self, port: u16) -> BoxFuture<'_, Result<Option<PortOwner>, OsError>> {
        let owner = self.lock().port_owners.get(&port).cloned();
        Box::pin(async move { Ok(owner) })
    }

    fn signal_process(&self, pid: i32, signal: Signal) -> Result<(), OsError> {
        let mut state = self.lock();
        state.signals.push((pid, signal));
        if !state.alive.contains(&pid) {
            return Err(OsError::Signal {
                pid,
                errno: Errno::ESRCH,
            });
        }
        match signal {
            Signal::SIGTERM if state.term_responsive.contains(&pid) => state.mark_dead(pid),
            Signal::SIGKILL if !state.immortal.contains(&pid) => state.mark_dead(pid),
            _ => {}
        }
        Ok(())
    }

    fn process_alive(&self, pid: i32) -> bool {
        self.lock().alive.contains(&pid)
    }

    fn stop_service(&self, unit: &str) -> BoxFuture<'_, Result<(), OsError>> {
        let mut state = self.lock();
        state.stopped_units.push(unit.to_string());
        if !state.wedged_units.contains(unit) {
            state.active_units.remove(unit);
            let unit = unit.to_string();
            state
                .port_owners
                .retain(|_, owner| !matches!(owner, PortOwner::Service { unit: u, .. } if *u == unit));
        }
        drop(state);
        Box::pin(async { Ok(()) })
    }

    fn service_active(&self, unit: &str) -> BoxFuture<'_, Result<bool, OsError>> {
        let active = self.lock().active_units.contains(unit);
        Box::pin(async move { Ok(active) })
    }
}
