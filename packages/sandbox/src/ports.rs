// ABOUTME: Host port allocation for sandbox containers from a configured range
// ABOUTME: Tracks allocated ports and their owning container so groups can be released together

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Inclusive range of host ports handed out to containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(49152, 59152)
    }
}

/// Decides whether a port is usable at the OS level.
pub type PortCheck = Arc<dyn Fn(u16) -> bool + Send + Sync>;

#[derive(Default)]
struct PortState {
    allocated: BTreeSet<u16>,
    owners: HashMap<String, BTreeSet<u16>>,
}

impl PortState {
    fn forget(&mut self, port: u16) -> bool {
        let removed = self.allocated.remove(&port);
        self.owners.retain(|_, owned| {
            owned.remove(&port);
            !owned.is_empty()
        });
        removed
    }
}

/// Hands out free host ports and remembers which container owns them.
///
/// Every mutating operation runs under one lock, so a port is never handed
/// to two callers before it is released.
pub struct PortAllocator {
    range: PortRange,
    state: Mutex<PortState>,
    check: PortCheck,
}

impl PortAllocator {
    /// Create an allocator that checks candidate ports with a live bind before handing them out.
    ///
    /// `localhost` is resolved once here, not on every check.
    pub fn new(range: PortRange) -> Self {
        let addrs = bind_addresses();
        Self::with_check(range, Arc::new(move |port| is_port_bindable_on(&addrs, port)))
    }

    /// Create an allocator with a custom availability check
    pub fn with_check(range: PortRange, check: PortCheck) -> Self {
        Self {
            range,
            state: Mutex::new(PortState::default()),
            check,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Allocate the lowest usable port in the range
    pub async fn allocate(&self) -> Option<u16> {
        let mut state = self.state.lock().await;
        self.allocate_locked(&mut state)
    }

    fn allocate_locked(&self, state: &mut PortState) -> Option<u16> {
        for port in self.range.start..=self.range.end {
            if state.allocated.contains(&port) {
                continue;
            }
            if (self.check)(port) {
                state.allocated.insert(port);
                debug!(port, "Allocated port");
                return Some(port);
            }
        }
        None
    }

    /// Allocate `count` distinct ports, or none at all
    pub async fn allocate_batch(&self, count: usize) -> Option<Vec<u16>> {
        let mut state = self.state.lock().await;
        let mut reserved = Vec::with_capacity(count);

        for _ in 0..count {
            match self.allocate_locked(&mut state) {
                Some(port) => reserved.push(port),
                None => {
                    for port in &reserved {
                        state.allocated.remove(port);
                    }
                    warn!(
                        requested = count,
                        rolled_back = reserved.len(),
                        "Port range exhausted during batch allocation"
                    );
                    return None;
                }
            }
        }

        Some(reserved)
    }

    /// Record `owner` as the holder of `ports` for later bulk release
    pub async fn register_ownership(&self, owner: &str, ports: &[u16]) {
        let mut state = self.state.lock().await;
        let owned = state.owners.entry(owner.to_string()).or_default();
        owned.extend(ports.iter().copied());
    }

    /// Release a single port. Returns false if it was not allocated.
    pub async fn release(&self, port: u16) -> bool {
        let mut state = self.state.lock().await;
        state.forget(port)
    }

    /// Release every port registered under `owner`
    pub async fn release_by_owner(&self, owner: &str) -> Vec<u16> {
        let mut state = self.state.lock().await;
        let Some(owned) = state.owners.remove(owner) else {
            return Vec::new();
        };

        for port in &owned {
            state.allocated.remove(port);
        }
        debug!(owner, ports = ?owned, "Released ports by owner");
        owned.into_iter().collect()
    }

    /// Release a group of ports, returning how many were actually held
    pub async fn release_batch(&self, ports: &[u16]) -> usize {
        let mut state = self.state.lock().await;
        ports.iter().filter(|port| state.forget(**port)).count()
    }

    pub async fn owned_ports(&self, owner: &str) -> Vec<u16> {
        let state = self.state.lock().await;
        state
            .owners
            .get(owner)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn allocated_count(&self) -> usize {
        self.state.lock().await.allocated.len()
    }

    pub async fn available_count(&self) -> usize {
        let state = self.state.lock().await;
        let held = state
            .allocated
            .iter()
            .filter(|port| self.range.contains(**port))
            .count();
        self.range.len() - held
    }
}

/// Wildcard, loopback and every address `localhost` resolves to
pub fn bind_addresses() -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V4(Ipv4Addr::LOCALHOST)];
    if let Ok(resolved) = ("localhost", 0).to_socket_addrs() {
        for addr in resolved {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }
    }
    addrs
}

/// Check that `port` can be bound on every bind address with address reuse disabled
pub fn is_port_bindable(port: u16) -> bool {
    is_port_bindable_on(&bind_addresses(), port)
}

pub fn is_port_bindable_on(addrs: &[IpAddr], port: u16) -> bool {
    addrs
        .iter()
        .all(|ip| try_bind(SocketAddr::new(*ip, port)))
}

fn try_bind(addr: SocketAddr) -> bool {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    };
    // No IPv6 stack on this host: the address can't conflict.
    let Ok(socket) = socket else {
        return addr.is_ipv6();
    };
    if socket.set_reuseaddr(false).is_err() {
        return false;
    }

    match socket.bind(addr) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::AddrNotAvailable => true,
        Err(_) => false,
    }
}
