//! Exporter listeners
//!
//! Accepts connections on the primary TCP or Unix endpoint and on any
//! alternative TLS endpoints, and spawns a handler for each one.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use hwl_core::{Address, HostPort};

use crate::driver::Driver;
use crate::server::handler::{ConnectionHandler, HANDSHAKE_TIMEOUT};
use crate::session::Session;
use crate::tls::{self, EndpointCredentials};
use crate::ExportError;

/// Serves one enumerated driver tree to any number of clients
#[derive(Clone)]
pub struct ExporterServer {
    /// Tree being served
    session: Arc<Session>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl ExporterServer {
    /// Serve an already enumerated session
    pub fn new(session: Arc<Session>, cancel: CancellationToken) -> Self {
        Self { session, cancel }
    }

    /// Enumerate `root` and start TLS listeners for `alternative_endpoints`
    ///
    /// The alternative listeners run until `cancel` fires. An endpoint with
    /// port 0 is advertised with the port actually bound.
    pub async fn start(
        root: Arc<dyn Driver>,
        alternative_endpoints: &[String],
        cancel: CancellationToken,
    ) -> Result<Self, ExportError> {
        let session = Session::enumerate(root).await?;

        if alternative_endpoints.is_empty() {
            return Ok(Self::new(Arc::new(session), cancel));
        }

        let hosts = tls::parse_endpoints(alternative_endpoints)?;
        let credentials = EndpointCredentials::generate(&hosts)?;

        let mut advertised = Vec::with_capacity(hosts.len());
        let mut listeners = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let listener = TcpListener::bind((host.host.as_str(), host.port))
                .await
                .map_err(|source| ExportError::Bind {
                    address: host.to_string(),
                    source,
                })?;
            let bound = HostPort {
                host: host.host.clone(),
                port: listener.local_addr()?.port(),
            };
            tracing::info!("Alternative endpoint listening on {}", bound);
            advertised.push(credentials.advertise(&bound));
            listeners.push(listener);
        }

        let server = Self::new(
            Arc::new(session.with_alternative_endpoints(advertised)),
            cancel,
        );
        for listener in listeners {
            let server = server.clone();
            let acceptor = credentials.acceptor();
            tokio::spawn(async move {
                if let Err(e) = server.serve_tls(listener, acceptor).await {
                    tracing::error!("Alternative endpoint failed: {}", e);
                }
            });
        }
        Ok(server)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Bind `address` and serve until cancelled
    pub async fn serve(&self, address: &Address) -> Result<(), ExportError> {
        match address {
            Address::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|source| ExportError::Bind {
                        address: address.to_string(),
                        source,
                    })?;
                self.serve_tcp(listener).await
            }
            Address::Unix(path) => {
                let listener = bind_unix(path).map_err(|source| ExportError::Bind {
                    address: address.to_string(),
                    source,
                })?;
                let result = self.serve_unix(listener).await;
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::debug!("Failed to remove socket {:?}: {}", path, e);
                }
                result
            }
        }
    }

    /// Serve connections accepted on a bound TCP listener
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<(), ExportError> {
        tracing::info!("Exporter listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Exporter listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            socket.set_nodelay(true).ok();
                            self.handle_connection(socket, peer_addr.to_string());
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve connections accepted on a bound Unix listener
    pub async fn serve_unix(&self, listener: UnixListener) -> Result<(), ExportError> {
        let local = listener
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "<unnamed>".to_string());
        tracing::info!("Exporter listening on unix://{}", local);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Exporter listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, _)) => {
                            self.handle_connection(socket, format!("unix://{}", local));
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_tls(&self, listener: TcpListener, acceptor: TlsAcceptor) -> Result<(), ExportError> {
        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Failed to accept TLS connection: {}", e);
                        continue;
                    }
                },
            };

            let acceptor = acceptor.clone();
            let server = self.clone();
            tokio::spawn(async move {
                socket.set_nodelay(true).ok();
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
                    Ok(Ok(stream)) => {
                        server.handle_connection(stream, format!("tls://{}", peer_addr));
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("TLS handshake with {} failed: {}", peer_addr, e);
                    }
                    Err(_) => {
                        tracing::warn!("TLS handshake with {} timed out", peer_addr);
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle a new incoming connection
    fn handle_connection<T>(&self, io: T, peer: String)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::info!("New connection from {}", peer);

        let handler = ConnectionHandler::new(
            Arc::clone(&self.session),
            peer.clone(),
            self.cancel.child_token(),
        );

        tokio::spawn(async move {
            match handler.run(io).await {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer, e);
                }
            }
        });
    }
}

/// Bind a Unix socket, replacing a stale socket file
fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        tracing::debug!("Removing stale socket {:?}", path);
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}
