use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use crate::client::local_store::LocalFileStore;
use crate::protocol::tracker::TrackerClient;
use crate::util::start_tick;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Keeps this client listed as a seed of everything it can serve.
pub struct Reporter {
    store: Arc<LocalFileStore>,
    tracker: TrackerClient,
    port: u16,
    interval: Duration,
}

impl Reporter {
    pub fn new(
        store: Arc<LocalFileStore>,
        tracker: TrackerClient,
        port: u16,
        interval: Duration,
    ) -> Self {
        Reporter {
            store,
            tracker,
            port,
            interval,
        }
    }

    pub async fn report_once(&self) -> Result<()> {
        let ids = self.store.shareable_ids();
        log::trace!("reporting {} files on port {}", ids.len(), self.port);
        self.tracker.update(self.port, &ids).await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let ticker = start_tick(tick_tx, self.interval);

        loop {
            tokio::select! {
                Some(()) = tick_rx.recv() => {
                    if let Err(e) = self.report_once().await {
                        log::debug!("could not report to tracker: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    log::info!("reporter shutdown");
                    break;
                }
            }
        }
        ticker.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use tempfile::tempdir;
    use tokio::net::TcpListener;

    use super::*;
    use crate::server::dispatcher::TrackerDispatcher;
    use crate::server::journal::Journal;
    use crate::server::seed_registry::{SeedRegistry, DEFAULT_STALENESS_WINDOW};
    use crate::transport::serve;

    #[tokio::test]
    async fn only_files_with_blocks_are_reported() {
        let dir = tempdir().unwrap();
        let journal = Arc::new(Journal::open(&dir.path().join("journal.txt")).await.unwrap());
        let shared_id = journal.add(120, "shared.bin").await.unwrap();
        let pending_id = journal.add(300, "pending.bin").await.unwrap();
        let seeds = Arc::new(SeedRegistry::new(journal.ids()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(
            listener,
            Arc::new(TrackerDispatcher::new(
                journal,
                seeds.clone(),
                DEFAULT_STALENESS_WINDOW,
            )),
            shutdown_rx.clone(),
        ));

        let store = Arc::new(
            LocalFileStore::open(&dir.path().join("blocks"), &dir.path().join("downloads"))
                .unwrap(),
        );
        let shared = dir.path().join("shared.bin");
        fs::write(&shared, [1u8; 120]).unwrap();
        store.add_as_existing(shared_id, &shared).unwrap();
        store.add_empty(pending_id, 300, "pending.bin").unwrap();

        assert_eq!(store.shareable_ids(), vec![shared_id]);
        let reporter = Reporter::new(
            store,
            TrackerClient::new(tracker_addr.to_string(), Duration::from_secs(5)),
            6881,
            Duration::from_millis(10),
        );
        reporter.report_once().await.unwrap();

        let me = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881);
        let seeds_of = |id| {
            seeds
                .query(id, DEFAULT_STALENESS_WINDOW)
                .into_iter()
                .map(|s| s.addr)
                .collect::<Vec<_>>()
        };
        assert_eq!(seeds_of(shared_id), vec![me]);
        assert!(seeds_of(pending_id).is_empty());

        // the periodic loop reports right away and stops on shutdown
        let running = tokio::spawn(reporter.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }
}
