use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// A peer that reported holding blocks of a file. A seed set holds at most one
/// entry per address; `last_active` is refreshed on every report.
#[derive(Debug, Clone, Copy)]
pub struct Seed {
    pub addr: SocketAddrV4,
    last_active: SystemTime,
}

impl Seed {
    fn new(addr: SocketAddrV4, now: SystemTime) -> Self {
        Seed {
            addr,
            last_active: now,
        }
    }

    fn was_active_within(&self, window: Duration, now: SystemTime) -> bool {
        match now.duration_since(self.last_active) {
            Ok(elapsed) => elapsed < window,
            // reported "in the future" w.r.t. now: clock skew between callers, count it as fresh
            Err(_) => true,
        }
    }
}

type SeedSet = Arc<Mutex<Vec<Seed>>>;

/// Live seeds per published file.
///
/// Expiry is lazy: stale seeds are dropped by `query` while it scans the set, there
/// is no background sweeper. Each file id has its own lock, so reports and queries
/// for different files never wait on each other.
pub struct SeedRegistry {
    seeds_of_file: RwLock<HashMap<u32, SeedSet>>,
}

impl SeedRegistry {
    pub fn new(file_ids: impl IntoIterator<Item = u32>) -> Self {
        let seeds_of_file = file_ids
            .into_iter()
            .map(|id| (id, SeedSet::default()))
            .collect();
        SeedRegistry {
            seeds_of_file: RwLock::new(seeds_of_file),
        }
    }

    /// Makes `file_id` reportable. Idempotent.
    pub fn prepare(&self, file_id: u32) {
        if self.seeds_for(file_id).is_some() {
            return;
        }
        let mut seeds_of_file = self
            .seeds_of_file
            .write()
            .expect("another user panicked while holding the lock");
        seeds_of_file.entry(file_id).or_default();
    }

    pub fn report(&self, file_id: u32, addr: SocketAddrV4) {
        self.report_at(file_id, addr, SystemTime::now());
    }

    /// Inserts or refreshes the seed; ids that were never prepared are ignored.
    pub fn report_at(&self, file_id: u32, addr: SocketAddrV4, now: SystemTime) {
        let seeds = match self.seeds_for(file_id) {
            Some(seeds) => seeds,
            None => {
                log::debug!("ignoring report from {addr} for unknown file id {file_id}");
                return;
            }
        };
        let mut seeds = seeds
            .lock()
            .expect("another user panicked while holding the lock");
        match seeds.iter_mut().find(|s| s.addr == addr) {
            Some(seed) => seed.last_active = now,
            None => seeds.push(Seed::new(addr, now)),
        }
    }

    pub fn query(&self, file_id: u32, window: Duration) -> Vec<Seed> {
        self.query_at(file_id, window, SystemTime::now())
    }

    /// Seeds of `file_id` active within `window`, in first-report order. Stale seeds
    /// found during the scan are removed for good.
    pub fn query_at(&self, file_id: u32, window: Duration, now: SystemTime) -> Vec<Seed> {
        let seeds = match self.seeds_for(file_id) {
            Some(seeds) => seeds,
            None => return Vec::new(),
        };
        let mut seeds = seeds
            .lock()
            .expect("another user panicked while holding the lock");
        let before = seeds.len();
        seeds.retain(|s| s.was_active_within(window, now));
        if seeds.len() != before {
            log::debug!(
                "expired {} stale seeds of file {file_id}",
                before - seeds.len()
            );
        }
        seeds.clone()
    }

    fn seeds_for(&self, file_id: u32) -> Option<SeedSet> {
        self.seeds_of_file
            .read()
            .expect("another user panicked while holding the lock")
            .get(&file_id)
            .cloned()
    }

    #[cfg(test)]
    fn tracked(&self, file_id: u32) -> usize {
        self.seeds_for(file_id).map_or(0, |s| s.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::thread;

    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn seeds_expire_lazily_on_query() {
        let registry = SeedRegistry::new([]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let window = Duration::from_secs(300);

        registry.prepare(7);
        registry.report_at(7, addr(1, 8080), t0);

        let seeds = registry.query_at(7, window, t0 + Duration::from_secs(100));
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].addr, addr(1, 8080));
        assert_eq!(registry.tracked(7), 1);

        let seeds = registry.query_at(7, window, t0 + Duration::from_secs(310));
        assert!(seeds.is_empty());
        assert_eq!(registry.tracked(7), 0);
    }

    #[test]
    fn reports_for_unprepared_ids_are_ignored() {
        let registry = SeedRegistry::new([]);
        registry.report(999, addr(1, 8080));
        assert_eq!(registry.tracked(999), 0);
        assert!(registry.query(999, DEFAULT_STALENESS_WINDOW).is_empty());
    }

    #[test]
    fn ids_known_at_construction_are_prepared() {
        let registry = SeedRegistry::new([0, 1]);
        registry.report(1, addr(2, 9000));
        assert_eq!(registry.query(1, DEFAULT_STALENESS_WINDOW).len(), 1);
    }

    #[test]
    fn prepare_is_idempotent() {
        let registry = SeedRegistry::new([]);
        registry.prepare(3);
        registry.report(3, addr(1, 1));
        registry.prepare(3);
        assert_eq!(registry.tracked(3), 1);
    }

    #[test]
    fn repeated_report_refreshes_instead_of_duplicating() {
        let registry = SeedRegistry::new([5]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let window = Duration::from_secs(300);

        registry.report_at(5, addr(1, 8080), t0);
        registry.report_at(5, addr(2, 8080), t0);
        registry.report_at(5, addr(1, 8080), t0 + Duration::from_secs(250));
        assert_eq!(registry.tracked(5), 2);

        // only the refreshed seed survives, and it keeps its first-report position
        let seeds = registry.query_at(5, window, t0 + Duration::from_secs(400));
        assert_eq!(seeds.iter().map(|s| s.addr).collect::<Vec<_>>(), vec![addr(1, 8080)]);
    }

    #[test]
    fn query_keeps_first_report_order() {
        let registry = SeedRegistry::new([1]);
        for last in [3, 1, 2] {
            registry.report(1, addr(last, 7000));
        }
        let order: Vec<_> = registry
            .query(1, DEFAULT_STALENESS_WINDOW)
            .iter()
            .map(|s| s.addr)
            .collect();
        assert_eq!(order, vec![addr(3, 7000), addr(1, 7000), addr(2, 7000)]);
    }

    #[test]
    fn same_ip_different_port_are_distinct_seeds() {
        let registry = SeedRegistry::new([1]);
        registry.report(1, addr(1, 7000));
        registry.report(1, addr(1, 7001));
        assert_eq!(registry.query(1, DEFAULT_STALENESS_WINDOW).len(), 2);
    }

    #[test]
    fn concurrent_reports_and_queries_keep_the_set_consistent() {
        let registry = Arc::new(SeedRegistry::new([1, 2]));
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..50u16 {
                        registry.report(1 + (t as u32 % 2), addr(t, 1000 + i));
                        let _ = registry.query(1, DEFAULT_STALENESS_WINDOW);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.query(1, DEFAULT_STALENESS_WINDOW).len(), 4 * 50);
        assert_eq!(registry.query(2, DEFAULT_STALENESS_WINDOW).len(), 4 * 50);
    }
}
