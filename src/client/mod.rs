use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::client::local_store::LocalFileStore;
use crate::client::repl::Repl;
use crate::client::reporter::Reporter;
use crate::client::responder::PeerResponder;
use crate::client::scheduler::{DownloadScheduler, SchedulerConfig};
use crate::protocol::peer::TcpPeerClient;
use crate::protocol::tracker::TrackerClient;
use crate::transport::serve;

pub mod block_set;
pub mod error;
pub mod file_state;
pub mod local_store;
pub mod repl;
pub mod reporter;
pub mod responder;
pub mod scheduler;

/// Unit of transfer between peers, in bytes.
pub const BLOCK_SIZE: u64 = 100;

pub struct ClientConfig {
    pub port: u16,
    pub tracker_addr: String,
    pub blocks_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub tick_interval: Duration,
    pub max_concurrent_fetches: usize,
    pub report_interval: Duration,
    pub request_timeout: Duration,
}

/// Runs the peer responder, download scheduler and reporter in the background and
/// the interactive prompt in the foreground. Returns once the prompt exits or
/// `shutdown` fires; both stop every background task.
pub async fn run(config: ClientConfig, shutdown: watch::Sender<bool>) -> Result<()> {
    log::info!("initialize client");
    let store = Arc::new(
        LocalFileStore::open(&config.blocks_dir, &config.downloads_dir)
            .context("could not open local file store")?,
    );
    let tracker = TrackerClient::new(config.tracker_addr.clone(), config.request_timeout);
    let peers = TcpPeerClient::new(config.request_timeout);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("could not bind peer port {}", config.port))?;
    // with port 0 the OS picks one: advertise what we actually got
    let port = listener.local_addr()?.port();

    let responder = Arc::new(PeerResponder::new(store.clone()));
    let server = tokio::spawn(serve(listener, responder, shutdown.subscribe()));

    let scheduler = Arc::new(DownloadScheduler::new(
        store.clone(),
        tracker.clone(),
        peers.clone(),
        SchedulerConfig {
            tick_interval: config.tick_interval,
            max_concurrent_fetches: config.max_concurrent_fetches,
        },
    ));
    let scheduler = tokio::spawn(scheduler.run(shutdown.subscribe()));

    let reporter = Reporter::new(store.clone(), tracker.clone(), port, config.report_interval);
    let reporter = tokio::spawn(reporter.run(shutdown.subscribe()));

    let repl = Repl::new(store, tracker, peers, port);
    let outcome = repl
        .run(BufReader::new(io::stdin()), &mut io::stdout(), shutdown.subscribe())
        .await;

    // the prompt is gone: bring everything else down with it
    let _ = shutdown.send(true);
    for (name, task) in [("responder", server), ("scheduler", scheduler), ("reporter", reporter)] {
        if let Err(e) = task.await {
            log::error!("{name} task failed: {e}");
        }
    }
    log::info!("client stopped");
    outcome
}
