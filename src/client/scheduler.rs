use std::cmp::min;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::SeekFrom;
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::client::local_store::LocalFileStore;
use crate::client::BLOCK_SIZE;
use crate::protocol::peer::PeerClient;
use crate::protocol::tracker::SeedSource;
use crate::util::start_tick;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// One block to fetch; also the key of the in-flight set.
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct DownloadTask {
    pub file_id: u32,
    pub block_idx: u32,
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "block {} of file {}", self.block_idx, self.file_id)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_concurrent_fetches: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }
}

/// Picks at most `slots` missing blocks of `store` that are not already being
/// fetched, in ascending (file id, block index) order.
pub fn select_tasks(
    store: &LocalFileStore,
    in_flight: &HashSet<DownloadTask>,
    slots: usize,
) -> Vec<DownloadTask> {
    store
        .next_missing(slots, |file_id, block_idx| {
            in_flight.contains(&DownloadTask { file_id, block_idx })
        })
        .into_iter()
        .map(|(file_id, block_idx)| DownloadTask { file_id, block_idx })
        .collect()
}

/// Removes its task from the in-flight set when dropped, whatever the fetch outcome.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<DownloadTask>>>,
    task: DownloadTask,
}

impl InFlightGuard {
    fn claim(in_flight: Arc<Mutex<HashSet<DownloadTask>>>, task: DownloadTask) -> Self {
        in_flight
            .lock()
            .expect("another user panicked while holding the lock")
            .insert(task);
        InFlightGuard { in_flight, task }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // never panic in drop: a poisoned set is still a set
        let mut in_flight = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.remove(&self.task);
    }
}

/// Periodically turns missing blocks of local files into fetches from seeds.
pub struct DownloadScheduler<T, P> {
    store: Arc<LocalFileStore>,
    tracker: T,
    peers: Arc<P>,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<DownloadTask>>>,
    workers: Arc<Semaphore>,
}

impl<T, P> DownloadScheduler<T, P>
where
    T: SeedSource + Send + Sync + 'static,
    P: PeerClient + Send + Sync + 'static,
{
    pub fn new(store: Arc<LocalFileStore>, tracker: T, peers: P, config: SchedulerConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_fetches));
        DownloadScheduler {
            store,
            tracker,
            peers: Arc::new(peers),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            workers,
        }
    }

    /// Ticks until `shutdown` flips. Fetches already dispatched finish on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "download scheduler started: tick every {:?}, {} concurrent fetches",
            self.config.tick_interval,
            self.config.max_concurrent_fetches
        );
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let ticker = start_tick(tick_tx, self.config.tick_interval);

        loop {
            tokio::select! {
                Some(()) = tick_rx.recv() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    log::info!("download scheduler shutdown");
                    break;
                }
            }
        }
        ticker.abort();
    }

    /// One scheduling round. Returns the handles of the fetches it dispatched.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        let tasks = {
            let in_flight = self
                .in_flight
                .lock()
                .expect("another user panicked while holding the lock");
            let slots = self
                .config
                .max_concurrent_fetches
                .saturating_sub(in_flight.len());
            select_tasks(&self.store, &in_flight, slots)
        };
        if tasks.is_empty() {
            return Vec::new();
        }

        // one tracker round trip per file, shared by all of its tasks
        let mut seeds_of_file: BTreeMap<u32, Vec<SocketAddrV4>> = BTreeMap::new();
        for task in &tasks {
            if seeds_of_file.contains_key(&task.file_id) {
                continue;
            }
            let seeds = match self.tracker.sources(task.file_id).await {
                Ok(s) => s,
                Err(e) => {
                    log::debug!("could not get sources of file {}: {e:#}", task.file_id);
                    Vec::new()
                }
            };
            seeds_of_file.insert(task.file_id, seeds);
        }

        let mut handles = Vec::new();
        for task in tasks {
            let seeds = match seeds_of_file.get(&task.file_id) {
                Some(s) if !s.is_empty() => s.clone(),
                _ => {
                    log::trace!("no seeds for {task}, retrying next tick");
                    continue;
                }
            };

            let guard = InFlightGuard::claim(self.in_flight.clone(), task);
            let workers = self.workers.clone();
            let store = self.store.clone();
            let peers = self.peers.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                let _permit = match workers.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                match fetch_block(store, peers.as_ref(), task, &seeds).await {
                    Ok(true) => log::debug!("downloaded {task}"),
                    Ok(false) => log::trace!("no seed owns {task}"),
                    Err(e) => log::debug!("could not download {task}: {e:#}"),
                }
            }));
        }
        handles
    }

    #[cfg(test)]
    fn in_flight(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self
            .in_flight
            .lock()
            .expect("another user panicked while holding the lock")
            .iter()
            .copied()
            .collect();
        tasks.sort();
        tasks
    }
}

/// Finds the first seed owning the block, downloads it, writes it and marks it
/// owned. `Ok(false)` when no seed has it.
async fn fetch_block<P: PeerClient + Sync>(
    store: Arc<LocalFileStore>,
    peers: &P,
    task: DownloadTask,
    seeds: &[SocketAddrV4],
) -> Result<bool> {
    let mut owner = None;
    for seed in seeds {
        match peers.stat(*seed, task.file_id).await {
            Ok(owned) if owned.contains(&task.block_idx) => {
                owner = Some(*seed);
                break;
            }
            Ok(_) => {}
            Err(e) => log::trace!("stat of file {} from {seed} failed: {e:#}", task.file_id),
        }
    }
    let owner = match owner {
        Some(o) => o,
        None => return Ok(false),
    };

    let block = peers.get(owner, task.file_id, task.block_idx).await?;
    let path = match store.with_state(task.file_id, |state| state.path().to_path_buf()) {
        Some(p) => p,
        None => bail!("file {} is no longer tracked", task.file_id),
    };
    write_block(&path, task.block_idx, &block).await?;

    tokio::task::spawn_blocking(move || store.mark_as_ready(task.file_id, task.block_idx))
        .await
        .context("block state update panicked")??;
    Ok(true)
}

/// Writes `block` at its offset, dropping whatever would land past the end of file.
async fn write_block(path: &Path, block_idx: u32, block: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("could not open {}", path.display()))?;
    let len = file.metadata().await?.len();
    let offset = block_idx as u64 * BLOCK_SIZE;
    if offset >= len {
        bail!("block {block_idx} starts past the end of {}", path.display());
    }
    let end = min(len - offset, block.len() as u64) as usize;

    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(&block[..end]).await?;
    file.sync_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::net::Ipv4Addr;

    use tempfile::{tempdir, TempDir};

    use super::*;

    fn seed(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn block_bytes(file_id: u32, block_idx: u32) -> Vec<u8> {
        vec![(file_id * 16 + block_idx) as u8 + 1; BLOCK_SIZE as usize]
    }

    #[derive(Default)]
    struct FakeTracker {
        seeds: HashMap<u32, Vec<SocketAddrV4>>,
        broken: HashSet<u32>,
        calls: Mutex<Vec<u32>>,
    }

    impl SeedSource for FakeTracker {
        async fn sources(&self, file_id: u32) -> Result<Vec<SocketAddrV4>> {
            self.calls.lock().unwrap().push(file_id);
            if self.broken.contains(&file_id) {
                bail!("tracker unreachable");
            }
            Ok(self.seeds.get(&file_id).cloned().unwrap_or_default())
        }
    }

    struct FakePeers {
        owned: HashMap<(SocketAddrV4, u32), Vec<u32>>,
        unreachable: HashSet<SocketAddrV4>,
        failing_gets: HashSet<SocketAddrV4>,
        gate: Semaphore,
        stats: Mutex<Vec<SocketAddrV4>>,
        gets: Mutex<Vec<(SocketAddrV4, u32, u32)>>,
    }

    impl FakePeers {
        fn new() -> Self {
            FakePeers {
                owned: HashMap::new(),
                unreachable: HashSet::new(),
                failing_gets: HashSet::new(),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                stats: Mutex::new(Vec::new()),
                gets: Mutex::new(Vec::new()),
            }
        }

        fn closed_gate() -> Self {
            FakePeers {
                gate: Semaphore::new(0),
                ..FakePeers::new()
            }
        }
    }

    impl PeerClient for FakePeers {
        async fn stat(&self, peer: SocketAddrV4, file_id: u32) -> Result<Vec<u32>> {
            self.stats.lock().unwrap().push(peer);
            if self.unreachable.contains(&peer) {
                bail!("connection refused");
            }
            Ok(self.owned.get(&(peer, file_id)).cloned().unwrap_or_default())
        }

        async fn get(&self, peer: SocketAddrV4, file_id: u32, block_idx: u32) -> Result<Vec<u8>> {
            self.gate.acquire().await?.forget();
            self.gets.lock().unwrap().push((peer, file_id, block_idx));
            if self.failing_gets.contains(&peer) {
                bail!("connection reset");
            }
            Ok(block_bytes(file_id, block_idx))
        }
    }

    fn open_store(dir: &TempDir) -> Arc<LocalFileStore> {
        Arc::new(
            LocalFileStore::open(&dir.path().join("blocks"), &dir.path().join("downloads"))
                .unwrap(),
        )
    }

    fn scheduler(
        store: Arc<LocalFileStore>,
        tracker: FakeTracker,
        peers: FakePeers,
    ) -> DownloadScheduler<FakeTracker, FakePeers> {
        DownloadScheduler::new(store, tracker, peers, SchedulerConfig::default())
    }

    async fn join_all(handles: Vec<JoinHandle<()>>) {
        for h in handles {
            h.await.unwrap();
        }
    }

    #[test]
    fn selection_is_ordered_bounded_and_skips_in_flight() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(3, 200, "c.bin").unwrap();
        store.mark_as_ready(3, 0).unwrap();
        store.mark_as_ready(3, 1).unwrap();
        store.add_empty(2, 200, "b.bin").unwrap();
        store.add_empty(1, 300, "a.bin").unwrap();
        store.mark_as_ready(1, 1).unwrap();
        let mut in_flight = HashSet::new();
        in_flight.insert(DownloadTask {
            file_id: 1,
            block_idx: 0,
        });

        let tasks = select_tasks(&store, &in_flight, 4);
        assert_eq!(
            tasks,
            vec![
                DownloadTask { file_id: 1, block_idx: 2 },
                DownloadTask { file_id: 2, block_idx: 0 },
                DownloadTask { file_id: 2, block_idx: 1 },
            ]
        );
        assert_eq!(select_tasks(&store, &in_flight, 1).len(), 1);
        assert!(select_tasks(&store, &in_flight, 0).is_empty());
    }

    #[tokio::test]
    async fn fifth_block_waits_for_a_free_slot() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(0, 300, "a.bin").unwrap();
        store.add_empty(1, 200, "b.bin").unwrap();

        let mut tracker = FakeTracker::default();
        tracker.seeds.insert(0, vec![seed(1)]);
        tracker.seeds.insert(1, vec![seed(1)]);
        let mut peers = FakePeers::closed_gate();
        peers.owned.insert((seed(1), 0), vec![0, 1, 2]);
        peers.owned.insert((seed(1), 1), vec![0, 1]);
        let scheduler = scheduler(store.clone(), tracker, peers);

        let first = scheduler.tick().await;
        assert_eq!(first.len(), 4);
        assert_eq!(
            scheduler.in_flight(),
            vec![
                DownloadTask { file_id: 0, block_idx: 0 },
                DownloadTask { file_id: 0, block_idx: 1 },
                DownloadTask { file_id: 0, block_idx: 2 },
                DownloadTask { file_id: 1, block_idx: 0 },
            ]
        );
        // every slot is taken
        assert!(scheduler.tick().await.is_empty());

        scheduler.peers.gate.add_permits(4);
        join_all(first).await;
        assert!(scheduler.in_flight().is_empty());

        let second = scheduler.tick().await;
        assert_eq!(second.len(), 1);
        scheduler.peers.gate.add_permits(1);
        join_all(second).await;

        assert!(store.stats().iter().all(|s| s.blocks().is_complete()));
        assert!(scheduler.tick().await.is_empty());
    }

    #[tokio::test]
    async fn downloaded_blocks_land_in_the_file() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(2, 250, "movie.bin").unwrap();

        let mut tracker = FakeTracker::default();
        tracker.seeds.insert(2, vec![seed(1)]);
        let mut peers = FakePeers::new();
        peers.owned.insert((seed(1), 2), vec![0, 1, 2]);
        let scheduler = scheduler(store.clone(), tracker, peers);

        join_all(scheduler.tick().await).await;

        let contents = fs::read(store.downloads_dir().join("movie.bin")).unwrap();
        assert_eq!(contents.len(), 250);
        assert_eq!(contents[..100], block_bytes(2, 0));
        assert_eq!(contents[100..200], block_bytes(2, 1));
        assert_eq!(contents[200..], block_bytes(2, 2)[..50]);
        assert!(store.get(2).unwrap().blocks().is_complete());

        // a restart remembers what was downloaded
        drop(scheduler);
        let reopened = open_store(&dir);
        assert!(reopened.get(2).unwrap().missing_blocks().is_empty());
    }

    #[tokio::test]
    async fn seeds_are_probed_in_order_and_failures_fall_through() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(0, 100, "one.bin").unwrap();

        let mut tracker = FakeTracker::default();
        tracker.seeds.insert(0, vec![seed(1), seed(2), seed(3), seed(4)]);
        let mut peers = FakePeers::new();
        peers.unreachable.insert(seed(1));
        peers.owned.insert((seed(2), 0), vec![]);
        peers.owned.insert((seed(3), 0), vec![0]);
        peers.owned.insert((seed(4), 0), vec![0]);
        let scheduler = scheduler(store.clone(), tracker, peers);

        join_all(scheduler.tick().await).await;

        assert_eq!(
            *scheduler.peers.stats.lock().unwrap(),
            vec![seed(1), seed(2), seed(3)]
        );
        assert_eq!(*scheduler.peers.gets.lock().unwrap(), vec![(seed(3), 0, 0)]);
        assert!(store.get(0).unwrap().blocks().is_complete());
    }

    #[tokio::test]
    async fn files_without_seeds_are_left_for_later() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(0, 200, "orphan.bin").unwrap();
        store.add_empty(1, 100, "broken.bin").unwrap();

        let mut tracker = FakeTracker::default();
        tracker.broken.insert(1);
        let scheduler = scheduler(store.clone(), tracker, FakePeers::new());

        assert!(scheduler.tick().await.is_empty());
        assert!(scheduler.in_flight().is_empty());
        // one sources call per file, not per block
        assert_eq!(*scheduler.tracker.calls.lock().unwrap(), vec![0, 1]);
        assert!(scheduler.peers.stats.lock().unwrap().is_empty());

        scheduler.tick().await;
        assert_eq!(*scheduler.tracker.calls.lock().unwrap(), vec![0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn failed_fetch_releases_its_slot() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(0, 100, "one.bin").unwrap();

        let mut tracker = FakeTracker::default();
        tracker.seeds.insert(0, vec![seed(1)]);
        let mut peers = FakePeers::new();
        peers.owned.insert((seed(1), 0), vec![0]);
        peers.failing_gets.insert(seed(1));
        let scheduler = scheduler(store.clone(), tracker, peers);

        let handles = scheduler.tick().await;
        assert_eq!(handles.len(), 1);
        join_all(handles).await;

        assert!(scheduler.in_flight().is_empty());
        assert!(store.get(0).unwrap().blocks().is_empty());
        // no retry inside the task: the block is simply picked up again
        assert_eq!(scheduler.tick().await.len(), 1);
    }

    #[tokio::test]
    async fn blocks_nobody_owns_are_not_fetched() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.add_empty(0, 200, "half.bin").unwrap();

        let mut tracker = FakeTracker::default();
        tracker.seeds.insert(0, vec![seed(1)]);
        let mut peers = FakePeers::new();
        peers.owned.insert((seed(1), 0), vec![1]);
        let scheduler = scheduler(store.clone(), tracker, peers);

        join_all(scheduler.tick().await).await;

        assert_eq!(*scheduler.peers.gets.lock().unwrap(), vec![(seed(1), 0, 1)]);
        assert_eq!(store.get(0).unwrap().missing_blocks(), vec![0]);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let scheduler = Arc::new(DownloadScheduler::new(
            store,
            FakeTracker::default(),
            FakePeers::new(),
            SchedulerConfig {
                tick_interval: Duration::from_millis(5),
                max_concurrent_fetches: 2,
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }
}
