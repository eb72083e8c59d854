//! HTTP/1.1 request head parsing using the [`httparse`] crate.

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head is incomplete")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("unsupported Transfer-Encoding: {0}")]
    UnsupportedTransferEncoding(String),
}

/// A parsed HTTP/1.1 request.
///
/// [`Request::parse`] only consumes the head; the connection appends the body
/// once the declared [`content_length`](Self::content_length) bytes have been
/// buffered.
///
/// # Examples
///
/// ```
/// use httpconn::http::Request;
///
/// let raw = b"POST /upload?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3\r\n\r\nabc";
/// let (request, head_len) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.path(), "/upload");
/// assert_eq!(request.query_string(), Some("x=1"));
/// assert_eq!(request.content_length(), 3);
/// assert_eq!(&raw[head_len..], b"abc");
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    content_length: usize,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a request head from the start of `buf`.
    ///
    /// Returns the request (with an empty body) and the length of the head,
    /// i.e. the offset at which the body begins.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the `\r\n\r\n` terminator has not arrived yet.
    /// - [`RequestError::Parse`]: the head is malformed.
    /// - [`RequestError::InvalidContentLength`]: `Content-Length` is not a
    ///   number, or repeated with conflicting values.
    /// - [`RequestError::UnsupportedTransferEncoding`]: any `Transfer-Encoding`
    ///   is present; chunked bodies are not framed by this layer.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let head_len = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = Method::from(
            raw_req
                .method
                .ok_or(RequestError::MissingField { field: "method" })?,
        );

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            match std::str::from_utf8(header.value) {
                Ok(value) => header_map.insert(header.name, value),
                // Framing fields must never be dropped.
                Err(_) if header.name.eq_ignore_ascii_case("transfer-encoding") => {
                    let coding = String::from_utf8_lossy(header.value).into_owned();
                    return Err(RequestError::UnsupportedTransferEncoding(coding));
                }
                Err(_) if header.name.eq_ignore_ascii_case("content-length") => {
                    return Err(RequestError::InvalidContentLength);
                }
                Err(_) => {}
            }
        }

        if let Some(coding) = header_map.get("transfer-encoding") {
            return Err(RequestError::UnsupportedTransferEncoding(coding.to_owned()));
        }
        let content_length = declared_length(&header_map)?;

        Ok((
            Self {
                method,
                path,
                query,
                version,
                headers: header_map,
                content_length,
                body: Bytes::new(),
            },
            head_len,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the declared body length (`0` when no `Content-Length` was sent).
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Attaches the buffered body.
    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Returns `true` if the client allows the connection to be reused.
    ///
    /// An explicit `close` token always wins, then an explicit `keep-alive`
    /// token; otherwise HTTP/1.1 defaults to keep-alive and HTTP/1.0 to close.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.headers.has_token("connection", "keep-alive") {
            return true;
        }
        self.version >= 1
    }
}

// Every Content-Length field must be plain ASCII digits and agree; a missing
// header means no body.
fn declared_length(headers: &Headers) -> Result<usize, RequestError> {
    let mut declared = None;
    for (name, value) in headers.iter() {
        if !name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let digits = value.trim_matches(|c| c == ' ' || c == '\t');
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RequestError::InvalidContentLength);
        }
        let len: usize = digits
            .parse()
            .map_err(|_| RequestError::InvalidContentLength)?;
        match declared {
            Some(prev) if prev != len => return Err(RequestError::InvalidContentLength),
            _ => declared = Some(len),
        }
    }
    Ok(declared.unwrap_or(0))
}
