//! HTTP/1.1 response builder.
//!
//! A [`Response`] serializes into an ordered list of byte ranges rather than
//! one contiguous buffer: the head is rendered once and every body range is
//! handed to the transport as-is, so large bodies are never copied.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be written as a buffer sequence.
///
/// # Examples
///
/// ```
/// use httpconn::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "text/plain")
///     .chunk("Hello, ")
///     .chunk("world");
///
/// let buffers = response.into_buffers();
/// assert_eq!(buffers.len(), 3);
///
/// let head = std::str::from_utf8(&buffers[0]).unwrap();
/// assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(head.contains("Content-Length: 12\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<Bytes>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Appends a response header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body with a single range.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body.clear();
        self.body.push(body.into());
        self
    }

    /// Appends one more body range.
    #[must_use]
    pub fn chunk(mut self, range: impl Into<Bytes>) -> Self {
        self.body.push(range.into());
        self
    }

    /// Asks the connection to close after this response.
    ///
    /// `true` only permits reuse; the connection still decides (see
    /// [keep-alive](crate::connection#keep-alive)).
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Total length of all body ranges.
    pub fn content_length(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }

    /// Renders the head and returns it followed by each non-empty body range.
    ///
    /// Automatically writes `Connection: keep-alive`/`close` (replacing any
    /// handler-supplied value) and a trailing `Content-Length`.
    pub fn into_buffers(mut self) -> Vec<Bytes> {
        let content_length = self.content_length();
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);
        self.headers.remove("content-length");

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 64);
        head.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        head.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());

        let mut buffers = Vec::with_capacity(1 + self.body.len());
        buffers.push(head.freeze());
        buffers.extend(self.body.into_iter().filter(|range| !range.is_empty()));
        buffers
    }

    /// Builds the short plain-text response sent when a request is refused
    /// before reaching the handler. Always closes the connection.
    pub fn rejection(status: StatusCode) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(status.canonical_reason())
            .keep_alive(false)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
