use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out strictly increasing loopback ports starting at a fixed base.
///
/// Ports are never reclaimed, so a long-lived orchestrator eventually runs out of
/// the 16-bit port space; `allocate` then returns `None` instead of wrapping around.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            next: AtomicU32::new(u32::from(base)),
        }
    }

    pub fn allocate(&self) -> Option<u16> {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port).ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::PortAllocator;

    #[test]
    fn allocates_sequentially_from_base() {
        let ports = PortAllocator::new(9100);
        assert_eq!(ports.allocate(), Some(9100));
        assert_eq!(ports.allocate(), Some(9101));
        assert_eq!(ports.allocate(), Some(9102));
    }

    #[test]
    fn reports_exhaustion_instead_of_wrapping() {
        let ports = PortAllocator::new(u16::MAX);
        assert_eq!(ports.allocate(), Some(u16::MAX));
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.allocate(), None);
    }

    #[test]
    fn concurrent_callers_never_share_a_port() {
        let ports = Arc::new(PortAllocator::new(20_000));
        let handles = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter_map(|_| ports.allocate())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().expect("thread") {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 1_600);
    }
}
