use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::client::local_store::LocalFileStore;
use crate::client::BLOCK_SIZE;
use crate::protocol::peer::PeerRequest;
use crate::protocol::wire::{put_u32, read_u32, read_u8};
use crate::transport::ConnectionHandler;

/// Serves `stat` and `get` to other clients from the local store.
pub struct PeerResponder {
    store: Arc<LocalFileStore>,
}

impl PeerResponder {
    pub fn new(store: Arc<LocalFileStore>) -> Self {
        PeerResponder { store }
    }

    pub async fn respond<S>(&self, remote: SocketAddr, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let opcode = read_u8(stream).await?;
        let request = match PeerRequest::from_opcode(opcode) {
            Some(r) => r,
            None => {
                log::debug!("peer {remote} sent unknown opcode {opcode}");
                return Ok(());
            }
        };
        log::trace!("peer {remote} called {request}");

        match request {
            PeerRequest::Stat => self.stat(stream).await,
            PeerRequest::Get => self.get(stream).await,
        }
    }

    async fn stat<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let file_id = read_u32(stream).await?;
        let buf = self.store.with_state(file_id, |state| {
            let mut buf = Vec::with_capacity(state.blocks().owned_count() * 4);
            for block_idx in state.blocks().owned() {
                put_u32(&mut buf, block_idx);
            }
            buf
        });
        let buf = match buf {
            Some(b) => b,
            None => return Ok(()),
        };
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn get<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let file_id = read_u32(stream).await?;
        let block_idx = read_u32(stream).await?;
        let owned = self.store.with_state(file_id, |state| {
            (state.blocks().contains(block_idx), state.path().to_path_buf())
        });
        let path = match owned {
            Some((true, path)) => path,
            Some((false, _)) => bail!("block {block_idx} of file {file_id} is not available here"),
            None => bail!("block {block_idx} requested for unknown file {file_id}"),
        };

        let block = read_block(&path, block_idx).await?;
        stream.write_all(&block).await?;
        stream.flush().await?;
        Ok(())
    }
}

impl ConnectionHandler for PeerResponder {
    async fn handle(&self, remote: SocketAddr, mut stream: TcpStream) -> Result<()> {
        self.respond(remote, &mut stream).await
    }
}

/// Reads block `block_idx` of the file at `path`. A block that runs past the end
/// of the file comes back zero-padded to `BLOCK_SIZE`.
pub async fn read_block(path: &Path, block_idx: u32) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(block_idx as u64 * BLOCK_SIZE))
        .await?;
    let mut block = Vec::with_capacity(BLOCK_SIZE as usize);
    file.take(BLOCK_SIZE).read_to_end(&mut block).await?;
    block.resize(BLOCK_SIZE as usize, 0);
    Ok(block)
}
