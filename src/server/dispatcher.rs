use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::tracker::TrackerRequest;
use crate::protocol::wire::{
    put_u16, put_u32, put_u64, put_utf, read_u16, read_u32, read_u64, read_u8, read_utf,
};
use crate::server::journal::Journal;
use crate::server::seed_registry::SeedRegistry;
use crate::transport::ConnectionHandler;

/// Routes tracker requests to the journal and the seed registry.
pub struct TrackerDispatcher {
    journal: Arc<Journal>,
    seeds: Arc<SeedRegistry>,
    staleness_window: Duration,
}

impl TrackerDispatcher {
    pub fn new(
        journal: Arc<Journal>,
        seeds: Arc<SeedRegistry>,
        staleness_window: Duration,
    ) -> Self {
        TrackerDispatcher {
            journal,
            seeds,
            staleness_window,
        }
    }

    /// Serves a single request. Unknown opcodes are answered with nothing.
    pub async fn dispatch<S>(&self, client_ip: IpAddr, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let opcode = read_u8(stream).await?;
        let request = match TrackerRequest::from_opcode(opcode) {
            Some(r) => r,
            None => {
                log::info!("called /none route (opcode {opcode}) from {client_ip}");
                return Ok(());
            }
        };
        log::info!("called /{request} route from {client_ip}");

        match request {
            TrackerRequest::List => self.list(stream).await,
            TrackerRequest::Upload => self.upload(stream).await,
            TrackerRequest::Sources => self.sources(stream).await,
            TrackerRequest::Update => self.update(client_ip, stream).await,
        }
    }

    async fn list<S: AsyncWrite + Unpin>(&self, out: &mut S) -> Result<()> {
        let records = self.journal.records();
        let mut buf = Vec::new();
        put_u32(&mut buf, records.len() as u32);
        for record in records {
            put_u32(&mut buf, record.id);
            put_utf(&mut buf, &record.name)?;
            put_u64(&mut buf, record.size);
        }
        out.write_all(&buf).await?;
        out.flush().await?;
        Ok(())
    }

    async fn upload<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let name = read_utf(stream).await?;
        // negative sizes on the wire are clamped to an empty file
        let size = (read_u64(stream).await? as i64).max(0) as u64;

        let file_id = self.journal.add(size, &name).await?;
        self.seeds.prepare(file_id);

        stream.write_all(&file_id.to_be_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn sources<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let file_id = read_u32(stream).await?;
        let seeds = self.seeds.query(file_id, self.staleness_window);
        log::debug!("file {file_id} has {} active seeds", seeds.len());

        let mut buf = Vec::new();
        put_u32(&mut buf, seeds.len() as u32);
        for seed in seeds {
            buf.extend_from_slice(&seed.addr.ip().octets());
            put_u16(&mut buf, seed.addr.port());
        }
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn update<S: AsyncRead + Unpin>(&self, client_ip: IpAddr, stream: &mut S) -> Result<()> {
        let port = read_u16(stream).await?;
        let count = (read_u32(stream).await? as i32).max(0);
        let mut file_ids = Vec::new();
        for _ in 0..count {
            file_ids.push(read_u32(stream).await?);
        }

        let ip = match client_ip {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => ip,
                None => {
                    log::warn!("ignoring update from ipv6 client {client_ip}: seeds are ipv4 only");
                    return Ok(());
                }
            },
        };
        let seed = SocketAddrV4::new(ip, port);
        log::debug!("seed {seed} shares files {file_ids:?}");
        for file_id in file_ids {
            self.seeds.report(file_id, seed);
        }
        Ok(())
    }
}

impl ConnectionHandler for TrackerDispatcher {
    async fn handle(&self, remote: SocketAddr, mut stream: TcpStream) -> Result<()> {
        self.dispatch(remote.ip(), &mut stream).await
    }
}
