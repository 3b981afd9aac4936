//! Network Server
//!
//! TCP server for accepting connections from neighbors.

use std::sync::Arc;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message};
use crate::replication::{ErrorCode, PeerMessage};
use crate::error::{Error, Result};

/// Handler for messages received from neighbors
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message; a returned message is written back to the peer
    async fn handle(&self, peer_addr: &str, message: PeerMessage) -> Option<PeerMessage>;
}

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: Arc<dyn MessageHandler>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: Arc<dyn MessageHandler>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and start the server
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Peer server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Peer server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler.handle(&peer_addr, message).await {
                    match write_message(&mut writer, &response).await {
                        // Refused before writing; tell the peer instead of hanging up
                        Err(Error::Network(reason)) => {
                            tracing::warn!(
                                "Cannot send {} to {}: {}",
                                response.type_name(),
                                peer_addr,
                                reason
                            );
                            let refusal = PeerMessage::Error {
                                code: ErrorCode::Internal,
                                message: reason,
                            };
                            write_message(&mut writer, &refusal).await?;
                        }
                        other => other?,
                    }
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
