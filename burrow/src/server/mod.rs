//! Wire-protocol server.

mod connection;

use burrow_shared::{BurrowResult, Transport};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;

use crate::backend::Backend;

/// Anything a connection needs from its transport.
pub trait Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Conn for T {}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Box<dyn Conn>> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Accept loop: one task per client connection.
pub struct Server {
    backend: Backend,
    listen: Transport,
}

impl Server {
    pub fn new(backend: Backend, listen: Transport) -> Self {
        Self { backend, listen }
    }

    /// Serve until the shutdown signal changes. In-flight connections are
    /// cut off at the socket when the caller exits.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> BurrowResult<()> {
        let listener = self.bind().await?;
        tracing::info!(listen = %self.listen, "accepting connections");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(stream) => {
                            let backend = self.backend.clone();
                            tokio::spawn(async move {
                                if let Err(e) = connection::handle(backend, stream).await {
                                    tracing::debug!(error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    async fn bind(&self) -> BurrowResult<Listener> {
        match &self.listen {
            Transport::Unix { socket_path } => {
                // A stale socket from a previous run blocks the bind.
                match std::fs::remove_file(socket_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Listener::Unix(UnixListener::bind(socket_path)?))
            }
            Transport::Tcp { addr } => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
        }
    }
}
