//! Remote coordinator (HQ) adapter.
//!
//! When a crawl is orchestrated externally, this adapter replaces the local
//! queue: it pulls feed batches, reports discoveries and completions, and
//! exposes the coordinator's seencheck. Only the interface is owned here;
//! the coordinator service itself is an external collaborator.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use super::{QueuedUrl, SourceError, UrlSource};
use crate::config::HqSettings;
use crate::models::{ItemSource, UrlKind};

/// Connect timeout for coordinator calls.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total timeout for coordinator calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors from coordinator calls.
#[derive(Debug, Error)]
pub enum HqError {
    /// The HTTP client could not be constructed or the call failed.
    #[error("hq transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The coordinator answered with an error status.
    #[error("hq api error: status {status}")]
    Api {
        /// The status code observed.
        status: u16,
    },
}

/// The URL wire form: `{"value": ..., "type": "seed"|"asset"|"redirection"}`.
///
/// Hops and via are attached separately by the adapter payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUrl {
    /// Raw URL value.
    pub value: String,
    /// Wire classification.
    #[serde(rename = "type")]
    pub kind: UrlKind,
}

/// One entry of a feed batch handed out by the coordinator.
#[derive(Debug, Deserialize)]
struct FeedUrl {
    id: String,
    value: String,
    #[serde(default)]
    via: Option<String>,
    #[serde(default)]
    hops: u32,
}

/// One discovered URL reported back to the coordinator.
#[derive(Debug, Serialize)]
struct DiscoveredUrl {
    #[serde(flatten)]
    url: WireUrl,
    #[serde(skip_serializing_if = "Option::is_none")]
    via: Option<String>,
    hops: u32,
}

#[derive(Debug, Serialize)]
struct DiscoveredPayload {
    urls: Vec<DiscoveredUrl>,
    bypass_seencheck: bool,
}

#[derive(Debug, Serialize)]
struct FinishedPayload<'a> {
    ids: &'a [String],
}

/// Client for the coordinator's crawl API.
#[derive(Debug, Clone)]
pub struct HqClient {
    http: reqwest::Client,
    address: String,
    project: String,
}

impl HqClient {
    /// Builds a client for the configured coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`HqError::Transport`] when client construction fails.
    pub fn new(settings: &HqSettings) -> Result<Self, HqError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            address: settings.address.trim_end_matches('/').to_string(),
            project: settings.project.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/projects/{}/{path}", self.address, self.project)
    }
}

#[async_trait]
impl UrlSource for HqClient {
    fn origin(&self) -> ItemSource {
        ItemSource::Hq
    }

    #[instrument(skip(self))]
    async fn pull(&self, limit: usize) -> Result<Vec<QueuedUrl>, SourceError> {
        let response = self
            .http
            .get(self.endpoint("feed"))
            .query(&[("size", limit)])
            .send()
            .await
            .map_err(HqError::from)?;
        if !response.status().is_success() {
            return Err(HqError::Api {
                status: response.status().as_u16(),
            }
            .into());
        }
        let feed: Vec<FeedUrl> = response.json().await.map_err(HqError::from)?;
        Ok(feed
            .into_iter()
            .map(|entry| QueuedUrl {
                id: entry.id,
                value: entry.value,
                via: entry.via,
                hops: entry.hops,
                kind: UrlKind::Seed,
            })
            .collect())
    }

    #[instrument(skip(self, urls), fields(count = urls.len()))]
    async fn push(&self, urls: Vec<QueuedUrl>, bypass_seencheck: bool) -> Result<(), SourceError> {
        if urls.is_empty() {
            return Ok(());
        }
        let payload = DiscoveredPayload {
            urls: urls
                .into_iter()
                .map(|url| DiscoveredUrl {
                    url: WireUrl {
                        value: url.value,
                        kind: url.kind,
                    },
                    via: url.via,
                    hops: url.hops,
                })
                .collect(),
            bypass_seencheck,
        };
        let response = self
            .http
            .post(self.endpoint("discovered"))
            .json(&payload)
            .send()
            .await
            .map_err(HqError::from)?;
        if !response.status().is_success() {
            return Err(HqError::Api {
                status: response.status().as_u16(),
            }
            .into());
        }
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn mark_done(&self, ids: &[String]) -> Result<(), SourceError> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .http
            .post(self.endpoint("finished"))
            .json(&FinishedPayload { ids })
            .send()
            .await
            .map_err(HqError::from)?;
        if !response.status().is_success() {
            return Err(HqError::Api {
                status: response.status().as_u16(),
            }
            .into());
        }
        Ok(())
    }

    fn supports_seencheck(&self) -> bool {
        true
    }

    /// Asks the coordinator which of `urls` are unseen.
    ///
    /// Failure falls open: every URL is treated as unseen and the failure
    /// is logged. Dropping discoveries because the seencheck was briefly
    /// unreachable would silently shrink the crawl.
    #[instrument(skip(self, urls), fields(count = urls.len()))]
    async fn seencheck(&self, urls: Vec<QueuedUrl>) -> Vec<QueuedUrl> {
        if urls.is_empty() {
            return urls;
        }
        let payload: Vec<WireUrl> = urls
            .iter()
            .map(|url| WireUrl {
                value: url.value.clone(),
                kind: url.kind,
            })
            .collect();

        let response = match self
            .http
            .post(self.endpoint("seencheck"))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = response.status().as_u16(), "seencheck rejected, treating all urls as unseen");
                return urls;
            }
            Err(error) => {
                warn!(%error, "seencheck unreachable, treating all urls as unseen");
                return urls;
            }
        };

        match response.json::<Vec<WireUrl>>().await {
            Ok(unseen) => {
                let unseen_values: HashSet<String> =
                    unseen.into_iter().map(|url| url.value).collect();
                urls.into_iter()
                    .filter(|url| unseen_values.contains(&url.value))
                    .collect()
            }
            Err(error) => {
                warn!(%error, "seencheck response unreadable, treating all urls as unseen");
                urls
            }
        }
    }
}
