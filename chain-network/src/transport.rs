//! TCP transport for consensus messages
//!
//! Every message travels on its own short-lived connection: the sender dials,
//! writes one frame and hangs up. A Status request is the one exception, the
//! listener answers it on the same connection before closing.

use crate::codec::{framed, read_message, write_message};
use crate::{NetworkConfig, NetworkError, NetworkResult};
use chain_consensus::{
    Broadcaster, HandleOutcome, MessageHandler, MessageType, SignedConsensusMessage,
};
use chain_core::{Address, BlockNumber};
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Accept consensus connections until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    handler: Arc<MessageHandler>,
    config: NetworkConfig,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Consensus listener on {}", addr),
        Err(e) => warn!("Consensus listener address unavailable: {}", e),
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, &config).await {
                            debug!("Connection from {} dropped: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }

    info!("Consensus listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<MessageHandler>,
    config: &NetworkConfig,
) -> NetworkResult<()> {
    let mut stream = framed(stream, config.max_frame_size);
    let message = match timeout(config.connection_timeout(), read_message(&mut stream)).await?? {
        Some(message) => message,
        None => return Ok(()),
    };

    trace!(
        "Received {} from {} at {}/{}",
        message.msg_type,
        message.from,
        message.height,
        message.round
    );

    if let HandleOutcome::Reply(reply) = handler.process_message(&message) {
        timeout(config.connection_timeout(), write_message(&mut stream, &reply)).await??;
    }
    Ok(())
}

/// Dial `peer` and deliver one message
pub async fn send_message(
    peer: &str,
    message: &SignedConsensusMessage,
    connect_timeout: Duration,
    max_frame_size: usize,
) -> NetworkResult<()> {
    let stream = connect(peer, connect_timeout).await?;
    let mut stream = framed(stream, max_frame_size);
    timeout(connect_timeout, write_message(&mut stream, message)).await??;
    Ok(())
}

/// Send a Status request to `peer` and return the responder with the height it reports
pub async fn request_height(
    peer: &str,
    request: &SignedConsensusMessage,
    connect_timeout: Duration,
    max_frame_size: usize,
) -> NetworkResult<(Address, BlockNumber)> {
    let stream = connect(peer, connect_timeout).await?;
    let mut stream = framed(stream, max_frame_size);
    timeout(connect_timeout, write_message(&mut stream, request)).await??;

    let reply = timeout(connect_timeout, read_message(&mut stream))
        .await??
        .ok_or(NetworkError::NoReply)?;
    if reply.msg_type != MessageType::Status {
        return Err(NetworkError::UnexpectedReply(reply.msg_type.to_string()));
    }
    Ok((reply.from, reply.height))
}

async fn connect(peer: &str, connect_timeout: Duration) -> NetworkResult<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| NetworkError::Connection(format!("connect to {} timed out", peer)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Fan-out over TCP to a fixed peer list
pub struct TcpBroadcaster {
    peers: Arc<Vec<String>>,
    connect_timeout: Duration,
    max_frame_size: usize,
    permits: Arc<Semaphore>,
}

impl TcpBroadcaster {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            peers: Arc::new(config.peers.clone()),
            connect_timeout: config.connection_timeout(),
            max_frame_size: config.max_frame_size,
            permits: Arc::new(Semaphore::new(config.max_concurrent_sends)),
        }
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }
}

impl Broadcaster for TcpBroadcaster {
    fn broadcast(&self, message: &SignedConsensusMessage) {
        let message = Arc::new(message.clone());
        for peer in self.peers.iter().cloned() {
            let message = message.clone();
            let permits = self.permits.clone();
            let connect_timeout = self.connect_timeout;
            let max_frame_size = self.max_frame_size;
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = send_message(&peer, &message, connect_timeout, max_frame_size).await {
                    debug!("Failed to send {} to {}: {}", message.msg_type, peer, e);
                }
            });
        }
    }

    fn query_heights(
        &self,
        request: SignedConsensusMessage,
    ) -> BoxFuture<'_, Vec<(Address, BlockNumber)>> {
        Box::pin(async move {
            let queries = self.peers.iter().map(|peer| {
                let request = &request;
                async move {
                    match request_height(peer, request, self.connect_timeout, self.max_frame_size)
                        .await
                    {
                        Ok(report) => Some(report),
                        Err(e) => {
                            debug!("Status query to {} failed: {}", peer, e);
                            None
                        }
                    }
                }
            });
            join_all(queries).await.into_iter().flatten().collect()
        })
    }
}
