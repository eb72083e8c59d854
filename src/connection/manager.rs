//! Registry of live connections.
//!
//! The registry is an arena keyed by [`ConnectionId`]. Each entry holds the
//! stop signal, a stage observer and the task handle of one connection; the
//! connection value itself is owned by its task. Nothing outside the task
//! ever holds a reference to a connection, only its id, so a stop that races
//! the connection's own teardown can at worst find the id already gone.
//!
//! A stopped entry stays registered, marked as stopping, until its task has
//! shut the transport down and deregistered. Lingering sockets therefore
//! still count against connection limits.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, info};

use super::stage::Stage;
use super::transport::Transport;
use super::{Connection, StopSignal};
use crate::config::ConnectionConfig;
use crate::handler::SharedHandler;

/// Stable identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors returned by [`ConnectionManager::start`].
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("connection manager is shutting down")]
    ShuttingDown,
}

/// Snapshot of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub scheme: &'static str,
    pub peer: Option<SocketAddr>,
    pub stage: Stage,
    /// A stop was requested and teardown has not finished yet.
    pub stopping: bool,
}

struct Entry {
    stop: watch::Sender<bool>,
    stage: watch::Receiver<Stage>,
    // Taken by `stop_all` so the caller can await teardown.
    task: Option<JoinHandle<()>>,
    stopping: bool,
    scheme: &'static str,
    peer: Option<SocketAddr>,
}

impl Entry {
    // Returns false if the stop had already been requested.
    fn request_stop(&mut self) -> bool {
        if self.stopping {
            return false;
        }
        self.stopping = true;
        self.stop.send_replace(true);
        true
    }
}

// Deregisters when the connection task ends, however it ends. An aborted
// task never reaches `Connection::stop`.
struct Registration {
    manager: Arc<ConnectionManager>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.deregister(self.id);
    }
}

/// Tracks every accepted, not yet fully stopped connection.
///
/// An id is registered iff its connection has been started and has not yet
/// finished tearing down. [`stop`](Self::stop) and
/// [`stop_all`](Self::stop_all) only request the stop; the entry is removed
/// once the connection has shut its transport down, or its task has ended.
/// All registry mutation goes through one mutex.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use httpconn::{ConnectionConfig, ConnectionManager, Request, Response, StatusCode};
/// use httpconn::connection::TcpTransport;
///
/// # async fn example(stream: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
/// let manager = Arc::new(ConnectionManager::new());
/// let handler = Arc::new(|_req: Request| async { Response::new(StatusCode::Ok) });
///
/// let id = manager.start(
///     TcpTransport::new(stream),
///     handler,
///     Arc::new(ConnectionConfig::default()),
/// )?;
/// assert!(manager.contains(id));
///
/// assert!(manager.stop(id));
/// assert!(!manager.stop(id)); // already stopping
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ConnectionManager {
    registry: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("live", &self.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly accepted transport and spawns its connection task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShuttingDown`] once [`stop_all`](Self::stop_all)
    /// has run; the transport is dropped (closed) in that case.
    pub fn start<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        handler: SharedHandler,
        config: Arc<ConnectionConfig>,
    ) -> Result<ConnectionId, ManagerError> {
        let mut registry = self.lock();
        // Checked under the lock so stop_all cannot miss a late registration.
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let scheme = transport.url_scheme();
        let peer = transport.peer_addr();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (stage_tx, stage_rx) = watch::channel(Stage::Idle);

        let connection = Connection::new(
            id,
            transport,
            handler,
            config,
            Arc::clone(self),
            StopSignal::new(stop_rx),
            stage_tx,
        );
        let span = debug_span!("connection", conn = %id, peer = ?peer);
        let manager = Arc::clone(self);
        // The task cannot deregister before this insert: it needs the lock we hold.
        // The registration is built on first poll, so a task dropped unpolled
        // never touches the lock from inside this call.
        let task = tokio::spawn(
            async move {
                let _registration = Registration { manager, id };
                connection.run().await;
            }
            .instrument(span),
        );

        registry.insert(
            id,
            Entry {
                stop: stop_tx,
                stage: stage_rx,
                task: Some(task),
                stopping: false,
                scheme,
                peer,
            },
        );
        debug!(conn = %id, live = registry.len(), "connection registered");
        Ok(id)
    }

    /// Requests that one connection stop.
    ///
    /// Returns `true` if the connection was live and not yet stopping.
    /// Stopping an id that is unknown, already stopping or gone does nothing
    /// and returns `false`. The entry stays registered until teardown ends.
    pub fn stop(&self, id: ConnectionId) -> bool {
        let requested = self
            .lock()
            .get_mut(&id)
            .is_some_and(Entry::request_stop);
        if requested {
            debug!(conn = %id, "connection stop requested");
        }
        requested
    }

    /// Refuses further registrations and requests that every live connection
    /// stop.
    ///
    /// Returns the connection tasks so the caller can wait for their teardown;
    /// the registry empties as each one deregisters. A second call returns no
    /// tasks.
    pub fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let mut registry = self.lock();
        self.shutting_down.store(true, Ordering::Release);

        let tasks: Vec<_> = registry
            .values_mut()
            .filter_map(|entry| {
                entry.request_stop();
                entry.task.take()
            })
            .collect();
        info!(stopped = tasks.len(), "all connections stop requested");
        tasks
    }

    /// Removes `id` on behalf of a connection that closed itself.
    pub(crate) fn deregister(&self, id: ConnectionId) -> bool {
        let mut registry = self.lock();
        let removed = registry.remove(&id).is_some();
        if removed {
            debug!(conn = %id, live = registry.len(), "connection deregistered");
        }
        removed
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Returns `true` if `id` has been asked to stop but is still tearing down.
    pub fn is_stopping(&self, id: ConnectionId) -> bool {
        self.lock().get(&id).is_some_and(|entry| entry.stopping)
    }

    /// Number of registered connections, including those still tearing down.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids of every live connection, in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current stage of a live connection.
    pub fn stage(&self, id: ConnectionId) -> Option<Stage> {
        self.lock().get(&id).map(|entry| *entry.stage.borrow())
    }

    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().get(&id).map(|entry| ConnectionInfo {
            id,
            scheme: entry.scheme,
            peer: entry.peer,
            stage: *entry.stage.borrow(),
            stopping: entry.stopping,
        })
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned registry is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
