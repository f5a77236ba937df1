use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Serves one accepted connection: read the opcode, answer, return.
#[trait_variant::make(Send)]
pub trait ConnectionHandler {
    async fn handle(&self, remote: SocketAddr, stream: TcpStream) -> Result<()>;
}

/// Accept loop shared by the tracker and the peer responder: every accepted
/// connection gets its own task, errors only end that exchange.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>, mut shutdown: watch::Receiver<bool>)
where
    H: ConnectionHandler + Send + Sync + 'static,
{
    match listener.local_addr() {
        Ok(addr) => log::info!("start listening clients on {addr}"),
        Err(e) => log::warn!("listening on unknown address: {e}"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        log::error!("error while accepting socket: {e}");
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    log::trace!("connected {remote}");
                    if let Err(e) = handler.handle(remote, stream).await {
                        log::debug!("error while handling client {remote}: {e:#}");
                    }
                });
            }
            _ = shutdown.changed() => {
                log::info!("server shutdown");
                break;
            }
        }
    }
}
