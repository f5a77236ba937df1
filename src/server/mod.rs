use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::server::dispatcher::TrackerDispatcher;
use crate::server::journal::Journal;
use crate::server::seed_registry::SeedRegistry;
use crate::transport::serve;

pub mod dispatcher;
pub mod journal;
pub mod seed_registry;

pub struct TrackerConfig {
    pub port: u16,
    pub journal_path: PathBuf,
    pub staleness_window: Duration,
}

/// Replays the journal, prepares a seed set for every known file and serves
/// tracker requests until `shutdown` fires.
pub async fn run(config: TrackerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    log::info!("initialize tracker");
    let journal = Arc::new(Journal::open(&config.journal_path).await?);
    let seeds = Arc::new(SeedRegistry::new(journal.ids()));
    let dispatcher = Arc::new(TrackerDispatcher::new(
        journal,
        seeds,
        config.staleness_window,
    ));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("could not bind tracker port {}", config.port))?;
    serve(listener, dispatcher, shutdown).await;
    Ok(())
}
