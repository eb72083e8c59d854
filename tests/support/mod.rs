//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use httpconn::handler::SharedHandler;
use httpconn::{Buffer, Request, Response, StatusCode, Transport};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    ReadRequest,
    ReadBody,
    Write { ranges: usize },
    Shutdown,
}

#[derive(Debug, Default)]
pub struct Record {
    pub calls: Vec<Call>,
    pub written: Vec<u8>,
    pub writes_cancelled: usize,
}

impl Record {
    pub fn count(&self, call: Call) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }

    pub fn count_writes(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Write { .. }))
            .count()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

/// The test's side of a [`MockTransport`]: feeds bytes in and inspects what
/// the connection did.
pub struct Peer {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    log: Arc<Mutex<Record>>,
}

impl Peer {
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(bytes.into());
        }
    }

    /// Makes the next read with nothing queued return end-of-stream.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn record(&self) -> MutexGuard<'_, Record> {
        self.log.lock().unwrap()
    }
}

/// A [`Transport`] whose reads come from a channel and whose writes are
/// recorded. With `stall_writes` every write hangs until cancelled.
pub struct MockTransport {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
    log: Arc<Mutex<Record>>,
    stall_writes: bool,
}

pub fn pair() -> (MockTransport, Peer) {
    build(false)
}

pub fn stalled_pair() -> (MockTransport, Peer) {
    build(true)
}

fn build(stall_writes: bool) -> (MockTransport, Peer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = Arc::new(Mutex::new(Record::default()));
    (
        MockTransport {
            rx,
            leftover: Vec::new(),
            log: Arc::clone(&log),
            stall_writes,
        },
        Peer { tx: Some(tx), log },
    )
}

// Counts a cancelled write unless the write finished.
struct CancelGuard {
    log: Arc<Mutex<Record>>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.log.lock().unwrap().writes_cancelled += 1;
        }
    }
}

impl MockTransport {
    fn log(&self, call: Call) {
        self.log.lock().unwrap().calls.push(call);
    }

    async fn read_into(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.leftover = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.fill_from_slice(&self.leftover);
        self.leftover.drain(..n);
        Ok(n)
    }
}

impl Transport for MockTransport {
    async fn read_request(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        self.log(Call::ReadRequest);
        self.read_into(buf).await
    }

    async fn read_body(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        self.log(Call::ReadBody);
        self.read_into(buf).await
    }

    async fn write_response(&mut self, buffers: &[Bytes]) -> io::Result<()> {
        self.log(Call::Write {
            ranges: buffers.len(),
        });
        let mut guard = CancelGuard {
            log: Arc::clone(&self.log),
            armed: true,
        };
        if self.stall_writes {
            std::future::pending::<()>().await;
        }
        guard.armed = false;
        let mut record = self.log.lock().unwrap();
        for range in buffers {
            record.written.extend_from_slice(range);
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.log(Call::Shutdown);
    }

    fn url_scheme(&self) -> &'static str {
        "mock"
    }
}

/// Polls `cond` every millisecond, panicking if it never holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}

/// A handler that counts its calls and answers `200` with three body ranges.
pub fn counting_handler() -> (SharedHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler: SharedHandler = Arc::new(move |_req: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            Response::new(StatusCode::Ok)
                .chunk("one,")
                .chunk("two,")
                .chunk("three")
        }
    });
    (handler, calls)
}
