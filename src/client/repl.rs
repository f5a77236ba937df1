use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::client::local_store::LocalFileStore;
use crate::protocol::peer::{PeerClient, TcpPeerClient};
use crate::protocol::tracker::TrackerClient;

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Command {
    Help,
    List,
    Upload(PathBuf),
    Download(u32),
    Sources(u32),
    Stats(Option<(SocketAddrV4, u32)>),
    Update(Vec<u32>),
    Exit,
}

type Parser = fn(&[&str]) -> Result<Command, String>;

// verb, usage, parser
const COMMANDS: &[(&str, &str, Parser)] = &[
    ("help", "help", parse_help),
    ("list", "list", parse_list),
    ("upload", "upload <path>", parse_upload),
    ("download", "download <file id>", parse_download),
    ("sources", "sources <file id>", parse_sources),
    ("stats", "stats [<peer ip> <peer port> <file id>]", parse_stats),
    ("update", "update <file id>...", parse_update),
    ("exit", "exit", parse_exit),
];

fn parse_help(_: &[&str]) -> Result<Command, String> {
    Ok(Command::Help)
}

fn parse_list(_: &[&str]) -> Result<Command, String> {
    Ok(Command::List)
}

fn parse_exit(_: &[&str]) -> Result<Command, String> {
    Ok(Command::Exit)
}

fn parse_upload(args: &[&str]) -> Result<Command, String> {
    match args {
        [path] => Ok(Command::Upload(PathBuf::from(path))),
        _ => Err("expected exactly one path".to_string()),
    }
}

fn parse_download(args: &[&str]) -> Result<Command, String> {
    match args {
        [id] => Ok(Command::Download(parse_id(id)?)),
        _ => Err("expected exactly one file id".to_string()),
    }
}

fn parse_sources(args: &[&str]) -> Result<Command, String> {
    match args {
        [id] => Ok(Command::Sources(parse_id(id)?)),
        _ => Err("expected exactly one file id".to_string()),
    }
}

fn parse_stats(args: &[&str]) -> Result<Command, String> {
    match args {
        [] => Ok(Command::Stats(None)),
        [ip, port, id] => {
            let ip: Ipv4Addr = ip
                .parse()
                .map_err(|_| format!("invalid ipv4 address {ip}"))?;
            let port: u16 = port.parse().map_err(|_| format!("invalid port {port}"))?;
            Ok(Command::Stats(Some((SocketAddrV4::new(ip, port), parse_id(id)?))))
        }
        _ => Err("expected no arguments, or a peer ip, port and file id".to_string()),
    }
}

fn parse_update(args: &[&str]) -> Result<Command, String> {
    let ids = args
        .iter()
        .map(|a| parse_id(a))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Command::Update(ids))
}

fn parse_id(raw: &str) -> Result<u32, String> {
    raw.parse().map_err(|_| format!("invalid file id {raw}"))
}

impl Command {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let verb = match words.next() {
            Some(v) => v,
            None => return Ok(None),
        };
        let args: Vec<&str> = words.collect();
        match COMMANDS.iter().find(|(name, _, _)| *name == verb) {
            Some((_, usage, parse)) => parse(&args)
                .map(Some)
                .map_err(|e| format!("{e}, usage: {usage}")),
            None => Err(format!("unknown command {verb}")),
        }
    }

    pub fn usage() -> String {
        let lines: Vec<String> = COMMANDS
            .iter()
            .map(|(_, usage, _)| format!("  {usage}"))
            .collect();
        format!("commands:\n{}", lines.join("\n"))
    }
}

/// Line-oriented console over the tracker, the local store and remote peers.
pub struct Repl {
    store: Arc<LocalFileStore>,
    tracker: TrackerClient,
    peers: TcpPeerClient,
    port: u16,
}

impl Repl {
    pub fn new(
        store: Arc<LocalFileStore>,
        tracker: TrackerClient,
        peers: TcpPeerClient,
        port: u16,
    ) -> Self {
        Repl {
            store,
            tracker,
            peers,
            port,
        }
    }

    /// Reads commands until `exit`, end of input or `shutdown`. Failed commands are
    /// reported on `out` and do not end the session.
    pub async fn run<R, W>(
        &self,
        input: R,
        out: &mut W,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        say(out, Command::usage()).await?;
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("could not read command")?,
                _ = shutdown.changed() => break,
            };
            let line = match line {
                Some(l) => l,
                None => break,
            };
            let command = match Command::parse(&line) {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    say(out, format!("{e}\n{}", Command::usage())).await?;
                    continue;
                }
            };
            if command == Command::Exit {
                break;
            }
            if let Err(e) = self.execute(command, out).await {
                log::debug!("command failed: {e:#}");
                say(out, format!("error: {e:#}")).await?;
            }
        }
        Ok(())
    }

    pub async fn execute<W: AsyncWrite + Unpin>(&self, command: Command, out: &mut W) -> Result<()> {
        match command {
            Command::Help | Command::Exit => say(out, Command::usage()).await,
            Command::List => {
                let files = self.tracker.list().await?;
                if files.is_empty() {
                    return say(out, "no files published").await;
                }
                for file in files {
                    say(out, file).await?;
                }
                Ok(())
            }
            Command::Upload(path) => {
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .with_context(|| format!("cannot upload {}", path.display()))?;
                if !metadata.is_file() {
                    bail!("{} is not a regular file", path.display());
                }
                let name = match path.file_name() {
                    Some(n) => n.to_string_lossy().to_string(),
                    None => bail!("{} has no file name", path.display()),
                };
                let file_id = self.tracker.upload(&name, metadata.len()).await?;
                let state = self.store.add_as_existing(file_id, &path)?;
                say(out, format!("uploaded as {state}")).await
            }
            Command::Download(file_id) => {
                if self.store.contains(file_id) {
                    return say(out, format!("file {file_id} is already tracked")).await;
                }
                let files = self.tracker.list().await?;
                let remote = match files.into_iter().find(|f| f.id == file_id) {
                    Some(f) => f,
                    None => bail!("the tracker has no file {file_id}"),
                };
                let state = self.store.add_empty(remote.id, remote.size, &remote.name)?;
                say(out, format!("queued {state}")).await
            }
            Command::Sources(file_id) => {
                let seeds = self.tracker.fetch_sources(file_id).await?;
                if seeds.is_empty() {
                    return say(out, format!("no active seeds for file {file_id}")).await;
                }
                for seed in seeds {
                    say(out, seed).await?;
                }
                Ok(())
            }
            Command::Stats(None) => {
                let stats = self.store.stats();
                if stats.is_empty() {
                    return say(out, "no local files").await;
                }
                for state in stats {
                    say(out, state).await?;
                }
                Ok(())
            }
            Command::Stats(Some((peer, file_id))) => {
                let owned = self.peers.stat(peer, file_id).await?;
                say(
                    out,
                    format!("{peer} owns {} blocks of file {file_id}: {owned:?}", owned.len()),
                )
                .await
            }
            Command::Update(file_ids) => {
                self.tracker.update(self.port, &file_ids).await?;
                say(out, format!("reported {} files", file_ids.len())).await
            }
        }
    }
}

async fn say<W: AsyncWrite + Unpin>(out: &mut W, text: impl Display) -> Result<()> {
    out.write_all(format!("{text}\n").as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
