//! URL records with hop/redirect accounting and the attached response.

use std::fmt;
use std::io;

use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted URL length (prevents memory issues with very long URLs).
pub const MAX_URL_LENGTH: usize = 2000;

/// Classification of a URL on the wire and in the item tree.
///
/// This is the `type` field of the HQ wire form; outlinks travel as `seed`
/// because they start a fresh crawl subtree on the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlKind {
    /// A root URL or a discovered outlink.
    Seed,
    /// An embedded reference captured alongside its page.
    Asset,
    /// A URL produced by following an HTTP redirect.
    Redirection,
}

impl UrlKind {
    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Asset => "asset",
            Self::Redirection => "redirection",
        }
    }
}

impl fmt::Display for UrlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised when validating a raw URL.
#[derive(Debug, Clone, Error)]
pub enum UrlError {
    /// The raw value exceeds [`MAX_URL_LENGTH`].
    #[error("url exceeds {MAX_URL_LENGTH} characters")]
    TooLong,

    /// The raw value is not a parseable absolute URL.
    #[error("malformed url: {0}")]
    Malformed(#[from] url::ParseError),

    /// Only http and https are crawlable.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The URL has no host to connect to.
    #[error("url has no host")]
    NoHost,
}

/// A URL discovered by the crawl.
///
/// Carries the raw string as found, the lazily parsed form, the hop count
/// (distance from the seed along the discovery tree) and the redirect count
/// (chain length along HTTP redirects for this one URL). A fetched response
/// may be attached by the archive stage.
#[derive(Debug)]
pub struct Url {
    raw: String,
    parsed: Option<url::Url>,
    hops: u32,
    redirects: u32,
    response: Option<Response>,
}

impl Url {
    /// Creates a URL record from a raw string. Parsing is deferred until
    /// the first [`parse`](Self::parse) call.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            parsed: None,
            hops: 0,
            redirects: 0,
            response: None,
        }
    }

    /// Sets the hop count.
    #[must_use]
    pub fn with_hops(mut self, hops: u32) -> Self {
        self.hops = hops;
        self
    }

    /// Sets the redirect count.
    #[must_use]
    pub fn with_redirects(mut self, redirects: u32) -> Self {
        self.redirects = redirects;
        self
    }

    /// Returns the raw string as discovered.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the hop count.
    #[must_use]
    pub fn hops(&self) -> u32 {
        self.hops
    }

    pub(crate) fn set_hops(&mut self, hops: u32) {
        self.hops = hops;
    }

    /// Returns the redirect count.
    #[must_use]
    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    /// Parses and validates the raw value, caching the result.
    ///
    /// Validation rules: must not exceed [`MAX_URL_LENGTH`], must parse as
    /// an absolute URL, must use http or https, must have a host.
    ///
    /// # Errors
    ///
    /// Returns [`UrlError`] when any rule is violated; the record stays
    /// unparsed and can be retried.
    pub fn parse(&mut self) -> Result<(), UrlError> {
        if self.parsed.is_some() {
            return Ok(());
        }
        if self.raw.len() > MAX_URL_LENGTH {
            return Err(UrlError::TooLong);
        }
        let parsed = url::Url::parse(&self.raw)?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
        }
        if parsed.host_str().is_none() {
            return Err(UrlError::NoHost);
        }
        self.parsed = Some(parsed);
        Ok(())
    }

    /// Returns the parsed form, if [`parse`](Self::parse) has succeeded.
    #[must_use]
    pub fn parsed(&self) -> Option<&url::Url> {
        self.parsed.as_ref()
    }

    /// Returns the host, once parsing has succeeded.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.parsed.as_ref().and_then(url::Url::host_str)
    }

    /// Attaches a fetched response.
    pub fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }

    /// Returns the attached response, if any.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Takes the attached response out of the record.
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A fetched HTTP response: status code, headers, and a body readable
/// exactly once as a byte stream.
#[derive(Debug)]
pub struct Response {
    status_code: u16,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    /// Builds a response from its parts.
    #[must_use]
    pub fn new(status_code: u16, headers: HeaderMap, body: Body) -> Self {
        Self {
            status_code,
            headers,
            body,
        }
    }

    /// Returns the HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Returns the response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive single-header lookup; non-UTF8 values read as absent.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// True when the status code indicates an HTTP redirect.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code, 301 | 302 | 303 | 307 | 308)
    }

    /// Returns the `Location` header, if present.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    /// Returns the body.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Returns the body mutably.
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }
}

/// Response body state machine.
///
/// A live stream is readable exactly once: it is either buffered into
/// memory (and becomes replayable) or drained and discarded to free the
/// connection. Never leak an unread body.
pub enum Body {
    /// A live byte stream, not yet consumed.
    Stream(Box<dyn AsyncRead + Send + Sync + Unpin>),
    /// Fully read into memory; replayable.
    Buffered(Bytes),
    /// Read to EOF and discarded.
    Drained,
}

impl Body {
    /// Wraps an in-memory body; already replayable.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Buffered(bytes.into())
    }

    /// Wraps a live reader.
    #[must_use]
    pub fn from_reader(reader: impl AsyncRead + Send + Sync + Unpin + 'static) -> Self {
        Self::Stream(Box::new(reader))
    }

    /// An empty, already-consumed body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Buffered(Bytes::new())
    }

    /// Reads the stream to completion into memory and becomes replayable.
    ///
    /// Calling this on an already buffered body is cheap (the bytes are
    /// reference-counted).
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error, or `UnexpectedEof` when the body
    /// was already drained.
    pub async fn buffer(&mut self) -> io::Result<Bytes> {
        match self {
            Self::Stream(reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                let bytes = Bytes::from(buf);
                *self = Self::Buffered(bytes.clone());
                Ok(bytes)
            }
            Self::Buffered(bytes) => Ok(bytes.clone()),
            Self::Drained => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "response body was already drained",
            )),
        }
    }

    /// Reads the body to EOF and discards it, returning the byte count.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error from the stream.
    pub async fn drain(&mut self) -> io::Result<u64> {
        match self {
            Self::Stream(reader) => {
                let drained = tokio::io::copy(reader, &mut tokio::io::sink()).await?;
                *self = Self::Drained;
                Ok(drained)
            }
            Self::Buffered(bytes) => {
                let len = bytes.len() as u64;
                *self = Self::Drained;
                Ok(len)
            }
            Self::Drained => Ok(0),
        }
    }

    /// True once the live stream has been fully read (buffered or drained).
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }

    /// Returns the buffered bytes, when replayable.
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            Self::Stream(_) | Self::Drained => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Body::Stream(..)"),
            Self::Buffered(bytes) => write!(f, "Body::Buffered({} bytes)", bytes.len()),
            Self::Drained => f.write_str("Body::Drained"),
        }
    }
}
