//! Network Client
//!
//! TCP client for talking to neighbors. Connections are pooled per address
//! and every call is bounded by the configured timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::replication::PeerMessage;
use crate::error::{Error, Result};

/// Connection pool entry
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for connecting to neighbors
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout (includes connecting)
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for the response
    ///
    /// A request that exceeds the request timeout is abandoned and any
    /// partially read response is discarded along with its connection.
    pub async fn send(&self, address: &str, message: PeerMessage) -> Result<PeerMessage> {
        let result = timeout(self.request_timeout, self.send_inner(address, message)).await;

        match result {
            Ok(inner_result) => inner_result,
            Err(_) => {
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: PeerMessage) -> Result<PeerMessage> {
        // Try the pooled connection first
        if let Some(entry) = self.get_connection(address).await {
            let mut entry = entry.lock().await;
            let (mut reader, mut writer) = entry.stream.split();

            let response = match write_message(&mut writer, &message).await {
                Ok(()) => read_message(&mut reader).await,
                Err(e) => Err(e),
            };

            match response {
                Ok(response) => {
                    entry.last_used = Instant::now();
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed ({}), reconnecting", address, e);
                    drop(entry);
                    self.remove_connection(address).await;
                }
            }
        }

        // Create new connection
        let mut stream = self.connect(address).await?;
        let response = {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            read_message(&mut reader).await?
        };

        self.store_connection(address.to_string(), stream).await;
        Ok(response)
    }

    /// Send without waiting for a response
    ///
    /// Uses the pooled connection when there is one. A failed write drops
    /// the connection and reports the error; it is not retried.
    pub async fn send_async(&self, address: &str, message: PeerMessage) -> Result<()> {
        let result = timeout(self.request_timeout, async {
            if let Some(entry) = self.get_connection(address).await {
                let mut entry = entry.lock().await;
                match write_message(&mut entry.stream, &message).await {
                    Ok(()) => {
                        entry.last_used = Instant::now();
                        return Ok(());
                    }
                    Err(e) => {
                        drop(entry);
                        self.remove_connection(address).await;
                        return Err(e);
                    }
                }
            }

            let mut stream = self.connect(address).await?;
            write_message(&mut stream, &message).await?;
            self.store_connection(address.to_string(), stream).await;
            Ok(())
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, stream: TcpStream) {
        let mut pool = self.pool.write().await;
        pool.insert(
            address,
            Arc::new(Mutex::new(PoolEntry {
                stream,
                last_used: Instant::now(),
            })),
        );
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();

        pool.retain(|addr, entry| {
            if let Ok(e) = entry.try_lock() {
                if now.duration_since(e.last_used) > max_idle {
                    tracing::debug!("Removing stale connection to {}", addr);
                    return false;
                }
            }
            true
        });
    }

    /// Close all connections
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}
