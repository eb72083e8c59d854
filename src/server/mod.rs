//! Async TCP server using Tokio.
//!
//! Owns the listening socket and hands every accepted stream to the
//! [`ConnectionManager`] wrapped in a [`TcpTransport`]. Shutdown stops the
//! accept loop first, then every live connection, and only then releases the
//! listener, so no connection outlives it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConnectionConfig, ServerConfig};
use crate::connection::{ConnectionManager, TcpTransport};
use crate::handler::{RequestHandler, SharedHandler};
use crate::http::{Response, StatusCode};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Pause after an accept failure caused by descriptor or memory exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Requests shutdown of a running [`Server`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Asks the server to stop. Calling it more than once is harmless.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use httpconn::{Request, Response, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run_until(
///         |_req: Request| async { Response::new(StatusCode::Ok).body("Hello!") },
///         async { let _ = tokio::signal::ctrl_c().await; },
///     ).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Binds the server to `addr` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        Self::with_config(ServerConfig::new(addr.as_ref())).await
    }

    /// Validates `config` and binds to its `bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] for an invalid configuration and
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn with_config(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener =
            TcpListener::bind(&config.bind_addr)
                .await
                .map_err(|e| ServerError::Bind {
                    addr: config.bind_addr.clone(),
                    source: e,
                })?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            local_addr,
            config,
            manager: Arc::new(ConnectionManager::new()),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the registry of live connections.
    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.manager)
    }

    /// Returns a handle that stops [`run`](Self::run) from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections until the [`ShutdownHandle`] fires, then shuts down.
    ///
    /// # Errors
    ///
    /// Accept failures are logged and never returned; the `Result` is kept for
    /// future listener-level failures.
    pub async fn run<H: RequestHandler>(self, handler: H) -> Result<(), ServerError> {
        self.run_until(handler, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but also shuts down when `signal` resolves.
    pub async fn run_until<H, S>(self, handler: H, signal: S) -> Result<(), ServerError>
    where
        H: RequestHandler,
        S: Future<Output = ()>,
    {
        let handler: SharedHandler = Arc::new(handler);
        let connection_config = Arc::new(self.config.connection.clone());
        let mut shutdown_rx = self.shutdown.tx.subscribe();
        tokio::pin!(signal);

        info!(address = %self.local_addr, "httpconn listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
                _ = &mut signal => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        if is_resource_exhaustion(&e) {
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        continue;
                    }
                },
            };

            self.admit(stream, peer_addr, &handler, &connection_config);
        }

        self.shutdown.shutdown();
        info!(live = self.manager.len(), "shutting down");
        let tasks = self.manager.stop_all();
        drain(tasks, self.config.drain_timeout()).await;

        drop(self.listener);
        info!("server stopped");
        Ok(())
    }

    fn admit(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: &SharedHandler,
        config: &Arc<ConnectionConfig>,
    ) {
        let max = self.config.max_connections;
        if max > 0 && self.manager.len() >= max {
            warn!(peer = %peer_addr, limit = max, "connection limit reached, sending 503");
            reject_over_limit(&stream);
            return;
        }

        if self.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
            }
        }

        match self.manager.start(
            TcpTransport::new(stream),
            Arc::clone(handler),
            Arc::clone(config),
        ) {
            Ok(id) => debug!(peer = %peer_addr, conn = %id, "connection accepted"),
            Err(e) => warn!(peer = %peer_addr, error = %e, "connection refused"),
        }
    }
}

// Best effort: a fresh socket's send buffer is empty, so a short response
// normally fits without blocking. Whatever does not fit is dropped with the socket.
fn reject_over_limit(stream: &TcpStream) {
    let response = Response::rejection(StatusCode::ServiceUnavailable);
    let bytes: Vec<u8> = response.into_buffers().concat();
    let _ = stream.try_write(&bytes);
}

/// Waits for stopped connection tasks, aborting those still running after `timeout`.
async fn drain(tasks: Vec<JoinHandle<()>>, timeout: Duration) {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    let all = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(timeout, all).await.is_err() {
        warn!(
            tasks = aborts.len(),
            "drain timeout elapsed, aborting remaining connections"
        );
        for abort in aborts {
            abort.abort();
        }
    }
}

// Raw OS codes for out-of-descriptors, out-of-buffers and out-of-memory.
// ENOMEM, ENFILE and EMFILE agree across Unixes; ENOBUFS does not.
fn exhaustion_codes() -> &'static [i32] {
    if cfg!(any(target_os = "linux", target_os = "android")) {
        &[12, 23, 24, 105]
    } else if cfg!(any(
        target_vendor = "apple",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )) {
        &[12, 23, 24, 55]
    } else if cfg!(windows) {
        // WSAEMFILE, WSAENOBUFS
        &[10024, 10055]
    } else {
        &[]
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
        || e
            .raw_os_error()
            .is_some_and(|code| exhaustion_codes().contains(&code))
}
