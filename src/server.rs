//! TCP server for hub connections.
//!
//! Accepts connections, wraps each one in a record-framed transport and
//! hands it to the hub. The hub does everything after that.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{HubError, Result};
use crate::runtime::Hub;
use crate::transport::TcpTransport;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    hub: Arc<Hub>,
    listen: String,
    max_message_size: usize,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(hub: Arc<Hub>, config: &Config) -> Self {
        Server {
            hub,
            listen: config.listen.clone(),
            max_message_size: config.max_message_size,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr)?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` fires, then close
    /// every connection.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                    permit.map_err(|_| HubError::InvalidState("connection limiter closed".into()))?
                }
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    trace!(peer = %addr, "Accepted connection");
                    let transport = TcpTransport::new(stream, self.max_message_size);
                    match self.hub.on_connection_opened(transport) {
                        Ok(id) => {
                            let hub = Arc::clone(&self.hub);
                            tokio::spawn(async move {
                                hub.closed(id).await;
                                drop(permit);
                            });
                        }
                        Err(e) => warn!(peer = %addr, error = %e, "Connection rejected"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        debug!("Listener stopped");
        self.hub.shutdown().await;
        Ok(())
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}
