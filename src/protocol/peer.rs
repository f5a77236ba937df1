use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::client::BLOCK_SIZE;
use crate::protocol::wire::{put_u32, read_u32_until_eof};

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum PeerRequest {
    Stat,
    Get,
}

impl PeerRequest {
    pub fn from_opcode(opcode: u8) -> Option<PeerRequest> {
        match opcode {
            1 => Some(PeerRequest::Stat),
            2 => Some(PeerRequest::Get),
            _ => None,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            PeerRequest::Stat => 1,
            PeerRequest::Get => 2,
        }
    }
}

impl fmt::Display for PeerRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerRequest::Stat => write!(f, "stat"),
            PeerRequest::Get => write!(f, "get"),
        }
    }
}

/// Data-plane calls a client makes to another client's responder.
#[trait_variant::make(Send)]
pub trait PeerClient {
    /// Block indices the peer currently owns for `file_id`.
    async fn stat(&self, peer: SocketAddrV4, file_id: u32) -> Result<Vec<u32>>;

    /// Exactly `BLOCK_SIZE` bytes of block `block_idx`.
    async fn get(&self, peer: SocketAddrV4, file_id: u32, block_idx: u32) -> Result<Vec<u8>>;
}

#[derive(Clone, Debug)]
pub struct TcpPeerClient {
    request_timeout: Duration,
}

impl TcpPeerClient {
    pub fn new(request_timeout: Duration) -> Self {
        TcpPeerClient { request_timeout }
    }

    async fn connect(&self, peer: SocketAddrV4) -> Result<TcpStream> {
        log::trace!("initiating connection to peer: {peer}");
        match timeout(self.request_timeout, TcpStream::connect(peer)).await {
            Err(_elapsed) => bail!("timed out connecting to peer {peer}"),
            Ok(Err(e)) => bail!("error initiating connection to peer {peer}: {e}"),
            Ok(Ok(stream)) => Ok(stream),
        }
    }
}

impl PeerClient for TcpPeerClient {
    async fn stat(&self, peer: SocketAddrV4, file_id: u32) -> Result<Vec<u32>> {
        let mut buf = vec![PeerRequest::Stat.opcode()];
        put_u32(&mut buf, file_id);

        let mut stream = self.connect(peer).await?;
        let exchange = async {
            stream.write_all(&buf).await?;
            stream.flush().await?;
            read_u32_until_eof(&mut stream).await
        };
        match timeout(self.request_timeout, exchange).await {
            Err(_elapsed) => bail!("timed out waiting stat from peer {peer}"),
            Ok(r) => r,
        }
    }

    async fn get(&self, peer: SocketAddrV4, file_id: u32, block_idx: u32) -> Result<Vec<u8>> {
        let mut buf = vec![PeerRequest::Get.opcode()];
        put_u32(&mut buf, file_id);
        put_u32(&mut buf, block_idx);

        let mut stream = self.connect(peer).await?;
        let exchange = async {
            stream.write_all(&buf).await?;
            stream.flush().await?;
            let mut block = vec![0; BLOCK_SIZE as usize];
            stream.read_exact(&mut block).await?;
            anyhow::Ok(block)
        };
        match timeout(self.request_timeout, exchange).await {
            Err(_elapsed) => bail!("timed out waiting block {block_idx} of file {file_id} from peer {peer}"),
            Ok(r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_opcode_table() {
        assert_eq!(PeerRequest::from_opcode(1), Some(PeerRequest::Stat));
        assert_eq!(PeerRequest::from_opcode(2), Some(PeerRequest::Get));
        assert_eq!(PeerRequest::from_opcode(3), None);
        assert_eq!(PeerRequest::Get.opcode(), 2);
    }
}
