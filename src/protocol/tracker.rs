use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Result};
use size::Size;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::protocol::wire::{
    put_u16, put_u32, put_u64, put_utf, read_u16, read_u32, read_u64, read_utf, ProtocolError,
};

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TrackerRequest {
    List,
    Upload,
    Sources,
    Update,
}

impl TrackerRequest {
    pub fn from_opcode(opcode: u8) -> Option<TrackerRequest> {
        match opcode {
            1 => Some(TrackerRequest::List),
            2 => Some(TrackerRequest::Upload),
            3 => Some(TrackerRequest::Sources),
            4 => Some(TrackerRequest::Update),
            _ => None,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            TrackerRequest::List => 1,
            TrackerRequest::Upload => 2,
            TrackerRequest::Sources => 3,
            TrackerRequest::Update => 4,
        }
    }
}

impl fmt::Display for TrackerRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TrackerRequest::List => "list",
            TrackerRequest::Upload => "upload",
            TrackerRequest::Sources => "sources",
            TrackerRequest::Update => "update",
        };
        write!(f, "{name}")
    }
}

/// A file published on the tracker, as seen from a client.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct RemoteFile {
    pub id: u32,
    pub name: String,
    pub size: u64,
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<4} {:>24}  {}",
            format!("{}:", self.id),
            self.name,
            Size::from_bytes(self.size)
        )
    }
}

/// Where the download scheduler learns which peers currently seed a file.
#[trait_variant::make(Send)]
pub trait SeedSource {
    async fn sources(&self, file_id: u32) -> Result<Vec<SocketAddrV4>>;
}

/// Client side of the tracker protocol: one TCP connection per request.
#[derive(Clone, Debug)]
pub struct TrackerClient {
    tracker_addr: String,
    request_timeout: Duration,
}

impl TrackerClient {
    pub fn new(tracker_addr: String, request_timeout: Duration) -> Self {
        TrackerClient {
            tracker_addr,
            request_timeout,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        log::trace!("connecting to tracker {}", self.tracker_addr);
        match timeout(
            self.request_timeout,
            TcpStream::connect(self.tracker_addr.as_str()),
        )
        .await
        {
            Err(_elapsed) => bail!("timed out connecting to tracker {}", self.tracker_addr),
            Ok(Err(e)) => bail!("could not connect to tracker {}: {e}", self.tracker_addr),
            Ok(Ok(stream)) => Ok(stream),
        }
    }

    pub async fn list(&self) -> Result<Vec<RemoteFile>> {
        let mut stream = self.connect().await?;
        let exchange = async {
            stream.write_all(&[TrackerRequest::List.opcode()]).await?;
            stream.flush().await?;

            let count = read_u32(&mut stream).await? as i32;
            let mut files = Vec::new();
            for _ in 0..count.max(0) {
                let id = read_u32(&mut stream).await?;
                let name = read_utf(&mut stream).await?;
                let size = read_u64(&mut stream).await?;
                files.push(RemoteFile { id, name, size });
            }
            anyhow::Ok(files)
        };
        self.bounded(exchange).await
    }

    pub async fn upload(&self, name: &str, size: u64) -> Result<u32> {
        let mut buf = vec![TrackerRequest::Upload.opcode()];
        put_utf(&mut buf, name)?;
        put_u64(&mut buf, size);

        let mut stream = self.connect().await?;
        let exchange = async {
            stream.write_all(&buf).await?;
            stream.flush().await?;
            read_u32(&mut stream).await
        };
        self.bounded(exchange).await
    }

    pub async fn fetch_sources(&self, file_id: u32) -> Result<Vec<SocketAddrV4>> {
        let mut buf = vec![TrackerRequest::Sources.opcode()];
        put_u32(&mut buf, file_id);

        let mut stream = self.connect().await?;
        let exchange = async {
            stream.write_all(&buf).await?;
            stream.flush().await?;

            let count = read_u32(&mut stream).await? as i32;
            let mut seeds = Vec::new();
            for _ in 0..count.max(0) {
                let mut ip: [u8; 4] = [0; 4];
                stream.read_exact(&mut ip).await?;
                let port = read_u16(&mut stream).await?;
                seeds.push(SocketAddrV4::new(Ipv4Addr::from(ip), port));
            }
            anyhow::Ok(seeds)
        };
        self.bounded(exchange).await
    }

    /// Advertises `file_ids` as available from this client's listening `port`.
    pub async fn update(&self, port: u16, file_ids: &[u32]) -> Result<()> {
        let count = match i32::try_from(file_ids.len()) {
            Ok(c) => c,
            Err(_) => bail!(ProtocolError::new(format!(
                "too many file ids to report: {}",
                file_ids.len()
            ))),
        };
        let mut buf = vec![TrackerRequest::Update.opcode()];
        put_u16(&mut buf, port);
        put_u32(&mut buf, count as u32);
        for id in file_ids {
            put_u32(&mut buf, *id);
        }

        let mut stream = self.connect().await?;
        let exchange = async {
            stream.write_all(&buf).await?;
            stream.flush().await?;
            // the tracker answers nothing: wait for it to close so the report is fully consumed
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await?;
            anyhow::Ok(())
        };
        self.bounded(exchange).await
    }

    async fn bounded<T>(&self, exchange: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.request_timeout, exchange).await {
            Err(_elapsed) => bail!("timed out waiting for tracker {}", self.tracker_addr),
            Ok(r) => r,
        }
    }
}

impl SeedSource for TrackerClient {
    async fn sources(&self, file_id: u32) -> Result<Vec<SocketAddrV4>> {
        self.fetch_sources(file_id).await
    }
}
