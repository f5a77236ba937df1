use clap::{Parser, Subcommand};
use rlimit::{getrlimit, setrlimit, Resource};
use std::cmp::min;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tokio::sync::watch;

use client::ClientConfig;
use server::TrackerConfig;

mod client;
mod protocol;
mod server;
mod transport;
mod util;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ")");

#[derive(Parser, Debug)]
#[command(version = VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,

    /// Optional log level
    #[arg(short, long, env, global = true, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the tracker: keeps the published files and who seeds them
    Tracker {
        /// Optional listening port
        #[arg(short, long, env = "TRACKER_PORT", default_value_t = 8081)]
        port: u16,

        /// Optional path of the file registry journal (parent directory will be created if it does not exist)
        #[arg(short, long, env, default_value = "tracker/files.journal")]
        journal: PathBuf,

        /// Optional number of seconds after which a seed that stopped reporting is forgotten
        #[arg(short, long, env, default_value_t = server::seed_registry::DEFAULT_STALENESS_WINDOW.as_secs())]
        staleness_secs: u64,
    },
    /// Run a client: shares local files, downloads queued ones, reads commands from stdin
    Client {
        /// Optional listening port for other clients
        #[arg(short, long, env = "CLIENT_PORT", default_value_t = 8080)]
        port: u16,

        /// Optional tracker address
        #[arg(short, long, env, default_value = "127.0.0.1:8081")]
        tracker: String,

        /// Optional directory holding the block state of every local file
        #[arg(short, long, env, default_value = "client/blocks")]
        blocks_dir: PathBuf,

        /// Optional directory where downloaded files are written
        #[arg(short, long, env, default_value = "client/downloads")]
        downloads_dir: PathBuf,

        /// Optional download scheduling period in milliseconds
        #[arg(long, env, default_value_t = client::scheduler::DEFAULT_TICK_INTERVAL.as_millis() as u64)]
        tick_ms: u64,

        /// Optional maximum number of blocks fetched at the same time
        #[arg(long, env, default_value_t = client::scheduler::DEFAULT_MAX_CONCURRENT_FETCHES)]
        max_concurrent_fetches: usize,

        /// Optional number of seconds between two reports to the tracker
        #[arg(long, env, default_value_t = client::reporter::DEFAULT_REPORT_INTERVAL.as_secs())]
        report_secs: u64,

        /// Optional timeout in seconds of every tracker and peer request
        #[arg(long, env, default_value_t = 10)]
        request_timeout_secs: u64,
    },
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

const MAX_OPENED_FILES: u64 = 16384;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );
    log::debug!("blockswarm {VERSION}");

    // every request is its own connection: bump ulimit if needed
    let (soft_limit, hard_limit) =
        getrlimit(Resource::NOFILE).expect("could not read current NOFILE ulimit");
    if soft_limit < MAX_OPENED_FILES {
        setrlimit(
            Resource::NOFILE,
            min(hard_limit, MAX_OPENED_FILES),
            hard_limit,
        )
        .expect("could not increase NOFILE ulimit");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted, shutting down");
            let _ = ctrl_c_tx.send(true);
        }
    });

    let outcome = match args.role {
        Role::Tracker {
            port,
            journal,
            staleness_secs,
        } => {
            server::run(
                TrackerConfig {
                    port,
                    journal_path: journal,
                    staleness_window: Duration::from_secs(staleness_secs),
                },
                shutdown_rx,
            )
            .await
        }
        Role::Client {
            port,
            tracker,
            blocks_dir,
            downloads_dir,
            tick_ms,
            max_concurrent_fetches,
            report_secs,
            request_timeout_secs,
        } => {
            if max_concurrent_fetches == 0 {
                log::error!("--max-concurrent-fetches must be at least 1");
                exit(1);
            }
            client::run(
                ClientConfig {
                    port,
                    tracker_addr: tracker,
                    blocks_dir,
                    downloads_dir,
                    tick_interval: Duration::from_millis(tick_ms.max(1)),
                    max_concurrent_fetches,
                    report_interval: Duration::from_secs(report_secs.max(1)),
                    request_timeout: Duration::from_secs(request_timeout_secs),
                },
                shutdown_tx,
            )
            .await
        }
    };

    // stdin reads may still hold a blocking thread: leave without waiting for it
    match outcome {
        Ok(()) => exit(0),
        Err(e) => {
            log::error!("{e:#}");
            exit(1);
        }
    }
}
