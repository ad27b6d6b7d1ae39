//! HTTP fetching contract consumed by the archive stage.
//!
//! The pipeline treats fetching as an external collaborator: anything that
//! can turn a URL into a status code, headers, and a read-once body stream
//! satisfies [`Fetcher`]. [`HttpFetcher`] is the bundled reqwest-backed
//! implementation. Timeouts are this layer's responsibility; the
//! post-processor will read whatever body it is handed.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use thiserror::Error;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};

use crate::models::{Body, Response, Url};

/// Connect timeout for the bundled fetcher.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total request timeout for the bundled fetcher; bounds body transfer.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// User agent sent by the bundled fetcher.
const USER_AGENT: &str = concat!("magpie/", env!("CARGO_PKG_VERSION"));

/// Fetch failures, by kind. These surface as item failures, never as
/// process failures.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Name resolution failed.
    #[error("dns resolution failed: {0}")]
    Dns(String),

    /// TCP connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// TLS negotiation failed.
    #[error("tls negotiation failed: {0}")]
    Tls(String),

    /// The request or transfer exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The server answered with an error status the fetcher refuses to
    /// hand back as a response.
    #[error("http error status {status}")]
    Http {
        /// The status code observed.
        status: u16,
    },

    /// Anything else at the protocol layer.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Turns a URL into a fetched response.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetches `url` and returns the response with a read-once body.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] classifying the transport failure.
    async fn fetch(&self, url: &Url) -> Result<Response, FetchError>;
}

/// Bundled reqwest-backed fetcher.
///
/// Redirects are never followed at this layer: the post-processor owns
/// redirect handling, so 3xx responses are handed back as-is. Error status
/// codes (4xx/5xx) are also handed back, because archiving an error page
/// is still archiving.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a fetcher with the crate's networking policy.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Protocol`] when client construction fails.
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|error| FetchError::Protocol(error.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), fields(url = %url.raw()))]
    async fn fetch(&self, url: &Url) -> Result<Response, FetchError> {
        let response = self
            .client
            .get(url.raw())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status_code = response.status().as_u16();
        let headers = response.headers().clone();
        debug!(status_code, "response received");

        let stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|error| io::Error::new(io::ErrorKind::Other, error)),
        );
        Ok(Response::new(
            status_code,
            headers,
            Body::from_reader(StreamReader::new(stream)),
        ))
    }
}

/// Maps a reqwest transport error onto the fetch error taxonomy.
fn classify_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        return FetchError::Timeout;
    }
    if let Some(status) = error.status() {
        return FetchError::Http {
            status: status.as_u16(),
        };
    }
    let text = error.to_string();
    let lowered = text.to_ascii_lowercase();
    if error.is_connect() {
        if lowered.contains("dns") {
            return FetchError::Dns(text);
        }
        if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
            return FetchError::Tls(text);
        }
        return FetchError::Connect(text);
    }
    FetchError::Protocol(text)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_fetch_attaches_status_headers_and_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::new(format!("{}/page", server.uri()));
        let mut response = fetcher.fetch(&url).await.unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert!(!response.body().is_consumed());

        let bytes = response.body_mut().buffer().await.unwrap();
        assert_eq!(&bytes[..], b"<html></html>");
    }

    #[tokio::test]
    async fn test_fetch_does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://example.com/next"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::new(format!("{}/moved", server.uri()));
        let response = fetcher.fetch(&url).await.unwrap();

        assert!(response.is_redirect());
        assert_eq!(response.location(), Some("http://example.com/next"));
    }

    #[tokio::test]
    async fn test_fetch_hands_back_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::new(format!("{}/gone", server.uri()));
        let response = fetcher.fetch(&url).await.unwrap();
        assert_eq!(response.status_code(), 404);
    }

    #[tokio::test]
    async fn test_fetch_classifies_connection_failures() {
        let fetcher = HttpFetcher::new().unwrap();
        // Reserved TEST-NET-1 address; nothing listens there.
        let url = Url::new("http://192.0.2.1:9/");
        let error = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(
            error,
            FetchError::Connect(_) | FetchError::Timeout | FetchError::Protocol(_)
        ));
    }
}
