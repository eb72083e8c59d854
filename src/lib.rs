//! # httpconn
//!
//! The asynchronous connection layer of an embedded HTTP/1.1 server.
//!
//! Every accepted socket becomes a [connection](connection) that reads a request head,
//! reads the declared body, dispatches to a [`RequestHandler`], and writes the
//! response, each stage under its own deadline, looping for keep-alive until
//! the client leaves, a deadline passes, or the server shuts down. A
//! [`ConnectionManager`] tracks every live connection so shutdown can stop
//! them all before the listener goes away.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use httpconn::{Request, Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(|_req: Request| async {
//!         Response::new(StatusCode::Ok).body("Hello, World!")
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod handler;
pub mod http;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use buffer::Buffer;
pub use config::{ConfigError, ConnectionConfig, ServerConfig};
pub use connection::{ConnectionError, ConnectionId, ConnectionManager, Stage, Transport};
pub use handler::{BoxFuture, RequestHandler};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError, ShutdownHandle};
