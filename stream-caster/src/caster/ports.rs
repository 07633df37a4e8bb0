//! Ephemeral port allocation for relay topologies.

use std::collections::HashSet;
use std::net::{Ipv4Addr, UdpSocket};

use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// Attempts per requested port before giving up.
const MAX_ATTEMPTS_PER_PORT: usize = 64;

/// Hands out currently unused UDP ports and remembers them until released.
///
/// The OS picks a free port by binding to port 0; the reservation set keeps
/// two concurrently launching jobs from receiving the same number between
/// the bind check and the relay process binding it.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` distinct ports.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let mut reserved = self.reserved.lock();
        let mut ports = Vec::with_capacity(count);

        for _ in 0..count {
            match Self::find_unreserved(&reserved) {
                Ok(port) => {
                    reserved.insert(port);
                    ports.push(port);
                }
                Err(e) => {
                    for port in &ports {
                        reserved.remove(port);
                    }
                    return Err(e);
                }
            }
        }

        debug!(?ports, "Allocated relay ports");
        Ok(ports)
    }

    /// Return ports to the pool.
    pub fn release(&self, ports: &[u16]) {
        if ports.is_empty() {
            return;
        }
        let mut reserved = self.reserved.lock();
        for port in ports {
            reserved.remove(port);
        }
        debug!(?ports, "Released relay ports");
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    fn find_unreserved(reserved: &HashSet<u16>) -> Result<u16> {
        for _ in 0..MAX_ATTEMPTS_PER_PORT {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            let port = socket.local_addr()?.port();
            if !reserved.contains(&port) {
                return Ok(port);
            }
        }
        Err(Error::Other(
            "Unable to find an unreserved local port".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_distinct_ports() {
        let allocator = PortAllocator::new();
        let ports = allocator.allocate(4).unwrap();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), 4);
        assert!(ports.iter().all(|p| *p != 0 && allocator.is_reserved(*p)));
    }

    #[test]
    fn test_release_frees_reservations() {
        let allocator = PortAllocator::new();
        let ports = allocator.allocate(2).unwrap();
        allocator.release(&ports);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let allocator = Arc::new(PortAllocator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.allocate(4).unwrap())
            })
            .collect();

        let mut all = HashSet::new();
        for t in threads {
            for port in t.join().unwrap() {
                assert!(all.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(all.len(), 32);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_active_reservations_are_unique(jobs in 1usize..6) {
            let allocator = PortAllocator::new();
            let mut seen = HashSet::new();
            for _ in 0..jobs {
                for port in allocator.allocate(4).unwrap() {
                    prop_assert!(seen.insert(port));
                }
            }
            prop_assert_eq!(allocator.reserved_count(), jobs * 4);
        }
    }
}
