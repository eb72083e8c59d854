//! The application-facing request handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::http::{Request, Response};

/// A heap-allocated, `Send` future, as returned by [`RequestHandler::handle`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Type-erased handler shared by every connection of a server.
pub type SharedHandler = Arc<dyn RequestHandler>;

/// Turns a fully buffered [`Request`] into a [`Response`].
///
/// The connection layer never looks inside either value beyond framing. A
/// handler is shared by all connections, so it must be `Send + Sync`; the
/// returned future is spawned as its own task and must be `'static`.
///
/// Application errors should be reported as ordinary responses (for example a
/// `500`). A handler that panics is treated like a transport failure: the
/// connection closes without writing anything.
///
/// Any `Fn(Request) -> impl Future<Output = Response>` implements this trait:
///
/// ```rust
/// use httpconn::{RequestHandler, Request, Response, StatusCode};
///
/// fn assert_handler(_: impl RequestHandler) {}
///
/// assert_handler(|req: Request| async move {
///     Response::new(StatusCode::Ok).body(req.path().to_owned())
/// });
/// ```
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request.
    fn handle(&self, request: Request) -> BoxFuture<Response>;
}

impl<T, F> RequestHandler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn handle(&self, request: Request) -> BoxFuture<Response> {
        Box::pin((self)(request))
    }
}
