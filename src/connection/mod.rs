//! Per-connection request/response cycle.
//!
//! A connection owns one [`Transport`] and drives it through the stages
//! defined in [`stage`]: read a request head, read its body if one is
//! declared, dispatch to the [`RequestHandler`](crate::RequestHandler), write
//! the response, then either start over (keep-alive) or close.
//!
//! Each connection runs as its own Tokio task spawned by the
//! [`ConnectionManager`]. Within the task everything is sequential: exactly
//! one transport future and at most one stage deadline are live at a time,
//! raced together with the manager's stop signal. Whichever loses the race is
//! dropped, which is how reads and writes are cancelled.
//!
//! The connection value itself is internal; it is only reachable through
//! [`ConnectionManager::start`] and the returned [`ConnectionId`]:
//!
//! ```compile_fail
//! use httpconn::connection::Connection;
//! ```
//!
//! # Keep-alive
//!
//! After a response is fully written the connection is reused only if all of
//! these hold:
//!
//! - the request allows it (HTTP/1.1 without `Connection: close`, or HTTP/1.0
//!   with `Connection: keep-alive`);
//! - the handler did not call [`Response::keep_alive`] with `false`;
//! - the request was not rejected before dispatch;
//! - the per-connection request limit has not been reached;
//! - the manager is not shutting down and no stop was requested.
//!
//! Bytes the client pipelined behind the served request are kept for the
//! next cycle.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::config::ConnectionConfig;
use crate::handler::SharedHandler;
use crate::http::{Request, RequestError, Response, StatusCode};

pub mod manager;
pub mod stage;
pub mod tcp;
pub mod timer;
pub mod transport;

pub use manager::{ConnectionId, ConnectionInfo, ConnectionManager, ManagerError};
pub use stage::{Completion, Effect, Stage, Transition};
pub use tcp::TcpTransport;
pub use timer::{StageTimer, TimerToken};
pub use transport::Transport;

/// Why a connection stopped serving.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out while {stage}")]
    TimedOut { stage: Stage },

    #[error("declared body of {declared} bytes does not fit a {capacity}-byte buffer")]
    PayloadTooLarge { declared: usize, capacity: usize },

    #[error("request head does not fit a {capacity}-byte buffer")]
    HeadTooLarge { capacity: usize },

    #[error("bad request: {0}")]
    BadRequest(#[from] RequestError),

    #[error("request handler panicked")]
    HandlerPanicked,

    #[error("connection stopped")]
    Stopped,
}

impl ConnectionError {
    /// Returns `true` for the ordinary ways a connection ends.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::Stopped)
    }
}

/// Receiving half of a connection's stop request.
///
/// The sending half lives in the manager's registry. A dropped sender counts
/// as a stop: nothing can reach the connection any more.
#[derive(Debug)]
pub(crate) struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    /// Resolves once a stop has been requested.
    pub(crate) async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

// Outcome of a transport future raced against the stage deadline and the stop signal.
enum Guarded<T> {
    Done(T),
    TimedOut,
    Stopped,
}

/// Runs `op` until it completes, the pending deadline of `timer` fires, or a
/// stop is requested. Completion clears the deadline before returning.
async fn guarded<F: Future>(
    op: F,
    timer: &mut StageTimer,
    stop: &mut StopSignal,
) -> Guarded<F::Output> {
    tokio::pin!(op);
    loop {
        let Some((token, deadline)) = timer.pending() else {
            return tokio::select! {
                biased;
                _ = stop.stopped() => Guarded::Stopped,
                out = &mut op => Guarded::Done(out),
            };
        };

        tokio::select! {
            biased;
            _ = stop.stopped() => return Guarded::Stopped,
            out = &mut op => {
                timer.cancel();
                return Guarded::Done(out);
            }
            _ = time::sleep_until(deadline) => {
                if timer.fire(token) {
                    return Guarded::TimedOut;
                }
            }
        }
    }
}

/// One client connection and its request/response state.
///
/// Created and spawned by [`ConnectionManager::start`]; the task owns the
/// value, the registry only holds its [`ConnectionId`].
pub(crate) struct Connection<T: Transport> {
    id: ConnectionId,
    transport: T,
    handler: SharedHandler,
    config: Arc<ConnectionConfig>,
    manager: Arc<ConnectionManager>,
    stop: StopSignal,
    stage: Stage,
    stage_tx: watch::Sender<Stage>,
    timer: StageTimer,
    stage_deadline: Option<Instant>,
    inbound: Buffer,
    outbound: Vec<Bytes>,
    request: Option<Request>,
    head_len: usize,
    body_len: usize,
    request_keep_alive: bool,
    rejected: bool,
    response: Option<Response>,
    requests_served: usize,
    close_reason: Option<ConnectionError>,
    closed: bool,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(
        id: ConnectionId,
        transport: T,
        handler: SharedHandler,
        config: Arc<ConnectionConfig>,
        manager: Arc<ConnectionManager>,
        stop: StopSignal,
        stage_tx: watch::Sender<Stage>,
    ) -> Self {
        let inbound = Buffer::with_capacity(config.buffer_size);
        Self {
            id,
            transport,
            handler,
            config,
            manager,
            stop,
            stage: Stage::Idle,
            stage_tx,
            timer: StageTimer::new(),
            stage_deadline: None,
            inbound,
            outbound: Vec::new(),
            request: None,
            head_len: 0,
            body_len: 0,
            request_keep_alive: false,
            rejected: false,
            response: None,
            requests_served: 0,
            close_reason: None,
            closed: false,
        }
    }

    /// Drives the connection until it closes.
    pub(crate) async fn run(mut self) {
        debug!(scheme = self.transport.url_scheme(), "connection started");

        let mut completion = Completion::Start;
        loop {
            let Transition { next, effect } = stage::step(self.stage, completion);
            self.enter(next);

            completion = match effect {
                Effect::ReadRequest => {
                    let timeout = if self.requests_served == 0 {
                        self.config.request_timeout()
                    } else {
                        self.config.keep_alive_timeout()
                    };
                    self.arm_stage(timeout);
                    self.read_request().await
                }
                Effect::ReadBody => {
                    self.arm_stage(self.config.body_timeout());
                    self.read_body().await
                }
                Effect::ContinueRead => {
                    self.rearm_stage();
                    if self.stage == Stage::ReadingBody {
                        self.read_body().await
                    } else {
                        self.read_request().await
                    }
                }
                Effect::Dispatch => self.dispatch().await,
                Effect::WriteResponse => {
                    self.arm_stage(self.config.write_timeout());
                    self.write_response().await
                }
                Effect::Recycle => {
                    self.recycle();
                    Completion::Start
                }
                Effect::Close => {
                    self.stop().await;
                    break;
                }
                Effect::None => break,
            };
        }
    }

    /// Cancels the pending deadline, shuts the transport down, deregisters
    /// from the manager and enters [`Stage::Closing`].
    ///
    /// Calling it again is a no-op.
    async fn stop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.timer.cancel();
        self.stage_deadline = None;
        self.enter(Stage::Closing);

        self.transport.shutdown().await;
        let deregistered = self.manager.deregister(self.id);

        let served = self.requests_served;
        match &self.close_reason {
            None => debug!(served, deregistered, "connection closed"),
            Some(reason) if reason.is_benign() => {
                debug!(served, deregistered, reason = %reason, "connection closed")
            }
            Some(reason @ ConnectionError::TimedOut { .. }) => {
                info!(served, deregistered, reason = %reason, "connection closed")
            }
            Some(reason) => warn!(served, deregistered, error = %reason, "connection closed"),
        }
    }

    fn enter(&mut self, next: Stage) {
        if next != self.stage {
            trace!(from = %self.stage, to = %next, "stage transition");
            self.stage = next;
            self.stage_tx.send_replace(next);
        }
    }

    fn arm_stage(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.timer.arm_at(deadline);
        self.stage_deadline = Some(deadline);
    }

    // Partial reads keep the deadline the stage started with.
    fn rearm_stage(&mut self) {
        if let Some(deadline) = self.stage_deadline {
            self.timer.arm_at(deadline);
        }
    }

    async fn read_request(&mut self) -> Completion {
        if let Some(completion) = self.parse_head() {
            return completion;
        }
        if self.inbound.is_full() {
            let capacity = self.inbound.capacity();
            return self.reject(
                ConnectionError::HeadTooLarge { capacity },
                StatusCode::RequestHeaderFieldsTooLarge,
            );
        }

        let read = self.transport.read_request(&mut self.inbound);
        match guarded(read, &mut self.timer, &mut self.stop).await {
            Guarded::Done(Ok(0)) => self.fail(ConnectionError::PeerClosed),
            Guarded::Done(Ok(n)) => {
                trace!(bytes = n, buffered = self.inbound.len(), "request bytes read");
                self.parse_head().unwrap_or(Completion::NeedMore)
            }
            Guarded::Done(Err(e)) => self.fail(ConnectionError::Io(e)),
            Guarded::TimedOut => self.timed_out(),
            Guarded::Stopped => self.stopped(),
        }
    }

    // `None` means the head is still incomplete.
    fn parse_head(&mut self) -> Option<Completion> {
        if self.inbound.is_empty() {
            return None;
        }

        match Request::parse(self.inbound.filled()) {
            Ok((request, head_len)) => {
                let declared = request.content_length();
                let capacity = self.inbound.capacity();
                if head_len.saturating_add(declared) > capacity {
                    return Some(self.reject(
                        ConnectionError::PayloadTooLarge { declared, capacity },
                        StatusCode::PayloadTooLarge,
                    ));
                }

                debug!(
                    method = %request.method(),
                    path = request.path(),
                    body = declared,
                    "request head parsed"
                );
                self.request_keep_alive = request.is_keep_alive();
                self.head_len = head_len;
                self.body_len = declared;
                self.request = Some(request);
                Some(Completion::HeadComplete { body: declared })
            }
            Err(RequestError::Incomplete) => None,
            Err(e) => {
                let status = match e {
                    RequestError::UnsupportedTransferEncoding(_) => StatusCode::NotImplemented,
                    _ => StatusCode::BadRequest,
                };
                Some(self.reject(ConnectionError::BadRequest(e), status))
            }
        }
    }

    async fn read_body(&mut self) -> Completion {
        let needed = self.head_len + self.body_len;
        if self.inbound.len() >= needed {
            return Completion::BodyComplete;
        }

        let read = self.transport.read_body(&mut self.inbound);
        match guarded(read, &mut self.timer, &mut self.stop).await {
            Guarded::Done(Ok(0)) => self.fail(ConnectionError::PeerClosed),
            Guarded::Done(Ok(n)) => {
                trace!(bytes = n, buffered = self.inbound.len(), needed, "body bytes read");
                if self.inbound.len() >= needed {
                    Completion::BodyComplete
                } else {
                    Completion::NeedMore
                }
            }
            Guarded::Done(Err(e)) => self.fail(ConnectionError::Io(e)),
            Guarded::TimedOut => self.timed_out(),
            Guarded::Stopped => self.stopped(),
        }
    }

    /// Runs the handler as its own task and waits for it here, so the
    /// response only ever touches connection state from this task.
    async fn dispatch(&mut self) -> Completion {
        let Some(mut request) = self.request.take() else {
            return Completion::Failed;
        };
        if self.body_len > 0 {
            let body = &self.inbound.filled()[self.head_len..self.head_len + self.body_len];
            request.set_body(Bytes::copy_from_slice(body));
        }

        let task = tokio::spawn(self.handler.handle(request));
        let abort = task.abort_handle();

        tokio::select! {
            biased;
            _ = self.stop.stopped() => {
                abort.abort();
                self.stopped()
            }
            joined = task => match joined {
                Ok(response) => {
                    self.response = Some(response);
                    Completion::Dispatched
                }
                Err(e) => {
                    error!(error = %e, "request handler failed");
                    self.fail(ConnectionError::HandlerPanicked)
                }
            },
        }
    }

    async fn write_response(&mut self) -> Completion {
        let Some(mut response) = self.response.take() else {
            return Completion::Failed;
        };
        let reuse = self.may_reuse(&response);
        response.set_keep_alive(reuse);
        let status = response.status();
        self.outbound = response.into_buffers();

        let write = self.transport.write_response(&self.outbound);
        match guarded(write, &mut self.timer, &mut self.stop).await {
            Guarded::Done(Ok(())) => {
                self.requests_served += 1;
                let bytes: usize = self.outbound.iter().map(Bytes::len).sum();
                debug!(status = status.as_u16(), bytes, reuse, "response written");
                Completion::Written {
                    reuse: reuse && !self.manager.is_shutting_down(),
                }
            }
            Guarded::Done(Err(e)) => self.fail(ConnectionError::Io(e)),
            Guarded::TimedOut => self.timed_out(),
            Guarded::Stopped => self.stopped(),
        }
    }

    fn may_reuse(&self, response: &Response) -> bool {
        let max = self.config.max_requests_per_connection;
        !self.rejected
            && self.request_keep_alive
            && response.is_keep_alive()
            && (max == 0 || self.requests_served + 1 < max)
            && !self.manager.is_shutting_down()
            && !self.stop.is_stopped()
    }

    fn recycle(&mut self) {
        self.inbound.consume(self.head_len + self.body_len);
        self.outbound.clear();
        self.request = None;
        self.response = None;
        self.head_len = 0;
        self.body_len = 0;
        self.request_keep_alive = false;
        self.rejected = false;
        self.stage_deadline = None;
        trace!(pipelined = self.inbound.len(), "connection kept alive");
    }

    fn reject(&mut self, reason: ConnectionError, status: StatusCode) -> Completion {
        warn!(status = status.as_u16(), error = %reason, "rejecting request");
        self.rejected = true;
        self.response = Some(Response::rejection(status));
        self.close_reason = Some(reason);
        Completion::Rejected
    }

    fn fail(&mut self, reason: ConnectionError) -> Completion {
        self.close_reason.get_or_insert(reason);
        Completion::Failed
    }

    fn timed_out(&mut self) -> Completion {
        let stage = self.stage;
        self.close_reason.get_or_insert(ConnectionError::TimedOut { stage });
        Completion::TimedOut
    }

    fn stopped(&mut self) -> Completion {
        self.close_reason.get_or_insert(ConnectionError::Stopped);
        Completion::Stop
    }
}
