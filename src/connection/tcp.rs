//! Plain TCP binding of [`Transport`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use super::transport::{Transport, write_all_buffers};
use crate::buffer::Buffer;

/// How long [`TcpTransport::shutdown`] keeps discarding peer bytes after the
/// half-close.
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on peer bytes discarded while lingering.
const LINGER_MAX_BYTES: usize = 64 * 1024;

/// A [`Transport`] over an accepted [`TcpStream`].
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Scheme reported by [`Transport::url_scheme`].
    pub const SCHEME: &'static str = "http";

    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self { stream, peer_addr }
    }

    /// Returns the underlying socket.
    pub fn socket(&self) -> &TcpStream {
        &self.stream
    }

    async fn read_into(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        self.stream.read_buf(&mut buf.spare_mut()).await
    }
}

impl Transport for TcpTransport {
    async fn read_request(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        self.read_into(buf).await
    }

    async fn read_body(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        self.read_into(buf).await
    }

    async fn write_response(&mut self, buffers: &[Bytes]) -> io::Result<()> {
        write_all_buffers(&mut self.stream, buffers).await
    }

    /// Half-closes the write side, then drains what the peer still sends
    /// (bounded in time and size) so unread bytes do not turn the final close
    /// into a reset that could destroy a response still in flight.
    async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!(error = %e, "half-close failed");
            return;
        }

        let mut scratch = [0u8; 4096];
        let mut drained = 0;
        let linger = async {
            while drained < LINGER_MAX_BYTES {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => drained += n,
                }
            }
        };
        let _ = tokio::time::timeout(LINGER_TIMEOUT, linger).await;
        trace!(drained, "transport shut down");
    }

    fn url_scheme(&self) -> &'static str {
        Self::SCHEME
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}
