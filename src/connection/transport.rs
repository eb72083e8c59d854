//! The capability interface between the connection state machine and the
//! byte channel underneath it.
//!
//! The [connection](super) state machine only ever talks to a
//! [`Transport`]; plain TCP ([`TcpTransport`](super::TcpTransport)) and an
//! encrypted variant differ only in how bytes move, never in what they mean.
//! Deadlines are owned by the connection, which races every transport future
//! against its stage timer and drops the future on expiry, so implementations
//! must be cancel-safe at their `.await` points.

use std::future::Future;
use std::io::{self, IoSlice};
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::Buffer;

/// A byte channel a [connection](super) can drive.
pub trait Transport: Send + 'static {
    /// Reads request-head bytes into the spare capacity of `buf`.
    ///
    /// Returns the number of bytes appended; `0` means the peer closed.
    /// Callers guarantee `buf` is not full.
    fn read_request(&mut self, buf: &mut Buffer) -> impl Future<Output = io::Result<usize>> + Send;

    /// Reads body bytes into the spare capacity of `buf`.
    ///
    /// Same contract as [`read_request`](Self::read_request); split out so a
    /// transport can treat the two phases differently.
    fn read_body(&mut self, buf: &mut Buffer) -> impl Future<Output = io::Result<usize>> + Send;

    /// Writes every byte of every range in `buffers`, in order.
    ///
    /// Short writes are retried internally; `Ok(())` means the whole sequence
    /// was handed to the peer.
    fn write_response(&mut self, buffers: &[Bytes])
    -> impl Future<Output = io::Result<()>> + Send;

    /// Orderly shutdown of the channel. Errors are swallowed: the connection
    /// is going away regardless.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;

    /// Fixed scheme identifier, for metadata only.
    fn url_scheme(&self) -> &'static str;

    /// Address of the remote peer, if the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Writes a whole buffer sequence with vectored writes, resuming after short
/// writes until every range is drained, then flushes.
///
/// Shared by every stream-backed [`Transport`].
pub async fn write_all_buffers<W>(writer: &mut W, buffers: &[Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut index = 0;
    let mut offset = 0;

    loop {
        while index < buffers.len() && offset == buffers[index].len() {
            index += 1;
            offset = 0;
        }
        if index == buffers.len() {
            break;
        }

        let slices: Vec<IoSlice<'_>> = std::iter::once(&buffers[index][offset..])
            .chain(buffers[index + 1..].iter().map(|b| &b[..]))
            .map(IoSlice::new)
            .collect();

        let mut written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        while written > 0 {
            let left = buffers[index].len() - offset;
            if written >= left {
                written -= left;
                index += 1;
                offset = 0;
            } else {
                offset += written;
                written = 0;
            }
        }
    }

    writer.flush().await
}
