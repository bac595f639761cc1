use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use crate::{config::PortRange, error::DemoError, port_inspect::PortInspector};

#[derive(Debug, Default)]
struct PortBook {
    reserved: BTreeSet<u16>,
    /// Ports that failed a bind probe while unreserved. Advisory only; every
    /// scan probes again.
    external: BTreeSet<u16>,
    /// Ports handed out through a lease and not yet released: either a
    /// launch in flight or a registered demo. The sweep never touches them.
    leased: BTreeSet<u16>,
}

/// Hands out ports from a fixed range. A port is reserved until released,
/// and is only handed out after an OS bind probe succeeds.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    inspector: Arc<dyn PortInspector>,
    book: Mutex<PortBook>,
}

impl PortAllocator {
    pub fn new(range: PortRange, inspector: Arc<dyn PortInspector>) -> Self {
        Self {
            range,
            inspector,
            book: Mutex::new(PortBook::default()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PortBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self) -> Result<u16, DemoError> {
        let mut book = self.book();
        self.acquire_in(&mut book)
    }

    fn acquire_in(&self, book: &mut PortBook) -> Result<u16, DemoError> {
        for port in self.range.iter() {
            if book.reserved.contains(&port) {
                continue;
            }
            if !self.inspector.is_bindable(port) {
                if book.external.insert(port) {
                    tracing::info!(port, "port held by a foreign process; skipping");
                }
                continue;
            }
            book.external.remove(&port);
            book.reserved.insert(port);
            tracing::debug!(port, "port reserved");
            return Ok(port);
        }

        tracing::warn!(range = %self.range, reserved = book.reserved.len(), "port range exhausted");
        Err(DemoError::ResourceExhausted { range: self.range })
    }

    pub fn acquire_lease(self: &Arc<Self>) -> Result<PortLease, DemoError> {
        let port = {
            let mut book = self.book();
            let port = self.acquire_in(&mut book)?;
            book.leased.insert(port);
            port
        };
        Ok(PortLease {
            port,
            allocator: self.clone(),
            armed: true,
        })
    }

    /// Returns whether the port was reserved. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        let mut book = self.book();
        book.leased.remove(&port);
        let released = book.reserved.remove(&port);
        if released {
            tracing::debug!(port, "port released");
        }
        released
    }

    /// Probes an unreserved port now. Our own reservations are never external.
    pub fn is_externally_occupied(&self, port: u16) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let mut book = self.book();
        if book.reserved.contains(&port) {
            return false;
        }
        let occupied = !self.inspector.is_bindable(port);
        if occupied {
            book.external.insert(port);
        } else {
            book.external.remove(&port);
        }
        occupied
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.book().reserved.contains(&port)
    }

    pub fn reserved(&self) -> Vec<u16> {
        self.book().reserved.iter().copied().collect()
    }

    /// Kills every process listening inside the range (except on ports in
    /// `keep` or under a live lease), then resets the book so that only those
    /// stay reserved. Returns the ports whose holders were all terminated.
    ///
    /// Blocking: walks `/proc` on the system inspector.
    pub fn reclaim_all(&self, keep: &[u16]) -> Vec<u16> {
        let mut keep: BTreeSet<u16> = keep.iter().copied().collect();
        keep.extend(self.book().leased.iter().copied());
        let mut freed = Vec::new();

        for holder in self.inspector.listeners(self.range) {
            if keep.contains(&holder.port) {
                continue;
            }
            let targets: Vec<u32> = holder
                .pids
                .iter()
                .copied()
                .filter(|pid| *pid != std::process::id())
                .collect();
            if targets.is_empty() {
                tracing::warn!(port = holder.port, "listener owner unknown; cannot reclaim");
                continue;
            }

            let mut all_killed = true;
            for pid in targets {
                if self.inspector.terminate(pid) {
                    tracing::warn!(port = holder.port, pid, "killed stray process on demo port");
                } else {
                    all_killed = false;
                    tracing::warn!(port = holder.port, pid, "failed to kill stray process");
                }
            }
            if all_killed {
                freed.push(holder.port);
            }
        }

        let mut book = self.book();
        let PortBook {
            reserved, leased, ..
        } = &mut *book;
        reserved.retain(|p| keep.contains(p) || leased.contains(p));
        book.external.clear();
        tracing::info!(swept = freed.len(), kept = keep.len(), "port range reclaimed");

        freed
    }
}

/// A port reservation that is released when dropped, unless handed over to
/// a demo record via `keep`.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
    armed: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn keep(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.release(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInspector;

    fn allocator(start: u16, end: u16, inspector: Arc<FakeInspector>) -> Arc<PortAllocator> {
        Arc::new(PortAllocator::new(
            PortRange::new(start, end).unwrap(),
            inspector,
        ))
    }

    #[test]
    fn hands_out_ascending_distinct_ports() {
        let a = allocator(9000, 9002, Arc::new(FakeInspector::default()));
        assert_eq!(a.acquire().unwrap(), 9000);
        assert_eq!(a.acquire().unwrap(), 9001);
        assert_eq!(a.acquire().unwrap(), 9002);
        assert_eq!(a.reserved(), vec![9000, 9001, 9002]);
    }

    #[test]
    fn skips_and_records_foreign_ports() {
        let inspector = Arc::new(FakeInspector::default());
        inspector.occupy(9000);
        let a = allocator(9000, 9001, inspector.clone());

        assert_eq!(a.acquire().unwrap(), 9001);
        assert!(a.is_externally_occupied(9000));
        assert!(!a.is_externally_occupied(9001));

        inspector.vacate(9000);
        assert!(!a.is_externally_occupied(9000));
    }

    #[test]
    fn exhaustion_then_single_reacquire() {
        let a = allocator(9000, 9002, Arc::new(FakeInspector::default()));
        let ports: Vec<u16> = (0..3).map(|_| a.acquire().unwrap()).collect();

        let err = a.acquire().unwrap_err();
        assert!(matches!(err, DemoError::ResourceExhausted { .. }));
        assert!(err.is_retryable());
        assert_eq!(a.reserved(), ports);

        assert!(a.release(ports[1]));
        assert_eq!(a.acquire().unwrap(), ports[1]);
        assert!(a.acquire().is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let a = allocator(9000, 9000, Arc::new(FakeInspector::default()));
        let p = a.acquire().unwrap();
        assert!(a.release(p));
        assert!(!a.release(p));
        assert!(!a.release(12345));
        assert!(a.reserved().is_empty());
    }

    #[test]
    fn dropped_lease_releases_and_kept_lease_does_not() {
        let a = allocator(9000, 9001, Arc::new(FakeInspector::default()));

        let lease = a.acquire_lease().unwrap();
        let p = lease.port();
        assert!(a.is_reserved(p));
        drop(lease);
        assert!(!a.is_reserved(p));

        let lease = a.acquire_lease().unwrap();
        let kept = lease.keep();
        assert!(a.is_reserved(kept));
    }

    #[test]
    fn reclaim_all_kills_strays_and_keeps_listed_ports() {
        let inspector = Arc::new(FakeInspector::default());
        let a = allocator(9000, 9005, inspector.clone());
        let tracked = a.acquire().unwrap();
        let _leaked = a.acquire().unwrap();

        inspector.add_listener(tracked, 111);
        inspector.add_listener(9004, 222);
        inspector.add_listener(9005, std::process::id());

        let freed = a.reclaim_all(&[tracked]);
        assert_eq!(freed, vec![9004]);
        assert_eq!(inspector.killed(), vec![222]);
        assert_eq!(a.reserved(), vec![tracked]);
    }

    #[test]
    fn reclaim_all_spares_ports_under_a_live_lease() {
        let inspector = Arc::new(FakeInspector::default());
        let a = allocator(9010, 9012, inspector.clone());
        let in_flight = a.acquire_lease().unwrap();
        let registered = a.acquire_lease().unwrap().keep();
        inspector.add_listener(registered, 333);

        let freed = a.reclaim_all(&[]);
        assert!(freed.is_empty());
        assert!(inspector.killed().is_empty());
        assert_eq!(a.reserved(), vec![in_flight.port(), registered]);

        drop(in_flight);
        assert!(a.release(registered));
        assert!(a.reserved().is_empty());
        a.reclaim_all(&[]);
        assert!(a.reserved().is_empty());
    }
}
