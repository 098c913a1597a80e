//! Loopback address pool.
//!
//! Candidates are scanned monotonically through the configured CIDR,
//! wrapping at the end, so recently freed addresses are not immediately
//! re-picked unless the scan comes back around. The pool itself holds no
//! allocation state; the caller supplies the in-use predicate (allocation
//! table plus live interface addresses) at each allocation.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Monotonically scanned pool of candidate loopback addresses.
#[derive(Debug)]
pub struct LoopbackPool {
    net: Ipv4Net,
    first: u32,
    size: u32,
    cursor: u32,
}

impl LoopbackPool {
    /// Build a pool over the host addresses of `net`.
    pub fn new(net: Ipv4Net) -> Self {
        let total = 1u64 << (32 - u32::from(net.prefix_len()));
        // Trim network and broadcast addresses for normal prefixes; /31
        // and /32 have no such reservations.
        let (first_offset, size) = if net.prefix_len() >= 31 {
            (0u32, total as u32)
        } else {
            (1u32, (total - 2) as u32)
        };
        Self {
            net,
            first: u32::from(net.network()) + first_offset,
            size,
            cursor: 0,
        }
    }

    /// Number of addresses in the pool.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The network this pool draws from.
    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    /// Whether `ip` belongs to this pool's range.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(&ip)
    }

    /// Assign the first candidate for which `in_use` returns false,
    /// advancing the scan cursor past it. Returns `None` when every
    /// address in the range is taken.
    pub fn allocate(&mut self, mut in_use: impl FnMut(Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        for step in 0..self.size {
            let offset = (self.cursor + step) % self.size;
            let candidate = Ipv4Addr::from(self.first + offset);
            if !in_use(candidate) {
                self.cursor = (offset + 1) % self.size;
                return Some(candidate);
            }
        }
        None
    }
}
