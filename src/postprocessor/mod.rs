//! Post-process stage: redirect handling and reference extraction.
//!
//! The heaviest single stage. Each archived item arrives with a fetched
//! response attached and leaves in exactly one of four states:
//!
//! ```text
//! Archived ──redirect?──────────────► GotRedirected (target url attached)
//!          ──extraction found refs──► GotChildren
//!          ──nothing to extract────── PostProcessed
//!          ──body failure/cutoff────► Failed
//! ```
//!
//! Every response body is read to completion exactly once before the item
//! leaves: buffered into a replayable reader when extraction runs,
//! drained and discarded otherwise.

pub mod extractor;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::models::{Item, ItemStatus, NodeId, Response, Url, UrlKind};
use crate::pipeline::StageHandler;
use crate::stats::PipelineStats;
use extractor::{extract_html, extract_link_header, extract_with_regex};

/// Handler for the post-process stage.
#[derive(Debug)]
pub struct Postprocessor {
    config: Arc<Config>,
    stats: Arc<PipelineStats>,
}

impl Postprocessor {
    /// Creates the handler.
    #[must_use]
    pub fn new(config: Arc<Config>, stats: Arc<PipelineStats>) -> Self {
        Self { config, stats }
    }
}

#[async_trait]
impl StageHandler for Postprocessor {
    fn name(&self) -> &'static str {
        "postprocessor"
    }

    async fn handle(&self, mut item: Item) -> Item {
        let root = item.root();
        // Items that failed upstream pass through untouched; they carry
        // no response to consume.
        if item.node(root).status() != ItemStatus::Archived {
            return item;
        }

        let nodes_before = item.node_count();
        postprocess(&self.config, &mut item).await;
        let discovered = item.node_count() - nodes_before;

        self.stats.record_postprocessed();
        if discovered > 0 {
            self.stats.record_children_discovered(discovered as u64);
        }
        item
    }
}

/// Runs the post-processing state machine over one archived item.
pub(crate) async fn postprocess(config: &Config, item: &mut Item) {
    let root = item.root();

    // Determine the URL set for this pass: an attached redirection, child
    // URLs handed over by the archiver, or the item's own URL.
    let redirection = item.node_mut(root).take_redirection();
    let pending = item.node_mut(root).take_pending_children();

    let next = if let Some(redirection) = redirection {
        process_attached_urls(config, item, root, vec![redirection], UrlKind::Redirection).await
    } else if pending.is_empty() {
        process_seed_url(config, item, root).await
    } else {
        process_attached_urls(config, item, root, pending, UrlKind::Asset).await
    };

    if let Err(error) = item.set_status(root, next) {
        error!(item = item.node(root).short_id(), %error, "item state machine violated");
    }
}

/// Post-processes the item's own URL (type `Seed`): the only place
/// redirects are followed.
async fn process_seed_url(config: &Config, item: &mut Item, root: NodeId) -> ItemStatus {
    let short_id = item.node(root).short_id().to_string();
    let Some(mut response) = item.node_mut(root).url_mut().take_response() else {
        warn!(item = %short_id, "archived item has no response attached");
        item.set_error(root, "no response attached by the archiver");
        return ItemStatus::Failed;
    };

    if response.is_redirect() {
        let redirects = item.node(root).url().redirects();
        let hops = item.node(root).url().hops();

        // The cutoff is checked before emitting, so a chain of
        // max_redirect + 1 responses fails here instead of looping.
        if redirects >= config.max_redirect {
            warn!(item = %short_id, redirects, "max redirects reached");
            drain_body(&mut response, &short_id).await;
            item.node_mut(root).url_mut().set_response(response);
            return ItemStatus::Failed;
        }

        match response.location().map(str::to_string) {
            Some(location) if !location.is_empty() => {
                debug!(item = %short_id, location = %location, "redirect observed");
                drain_body(&mut response, &short_id).await;
                item.node_mut(root).set_redirection(Some(
                    Url::new(location)
                        .with_hops(hops)
                        .with_redirects(redirects + 1),
                ));
                item.node_mut(root).url_mut().set_response(response);
                return ItemStatus::GotRedirected;
            }
            _ => {
                warn!(item = %short_id, "redirect response without a location header");
                drain_body(&mut response, &short_id).await;
                item.set_error(root, "redirect without Location header");
                item.node_mut(root).url_mut().set_response(response);
                return ItemStatus::Failed;
            }
        }
    }
    item.node_mut(root).set_redirection(None);

    // Short-circuit: nothing left for extraction to contribute.
    let hops = item.node(root).url().hops();
    if item.node(root).children_captured() > 0
        || (config.disable_assets_capture && hops >= config.max_hops)
    {
        drain_body(&mut response, &short_id).await;
        item.node_mut(root).url_mut().set_response(response);
        return ItemStatus::Failed;
    }

    // Buffer the body into memory; the live stream is replaced by a
    // replayable reader backed by the buffer.
    let bytes = match response.body_mut().buffer().await {
        Ok(bytes) => bytes,
        Err(buffer_error) => {
            error!(item = %short_id, error = %buffer_error, "unable to read response body");
            item.set_error(root, format!("unable to read response body: {buffer_error}"));
            item.node_mut(root).url_mut().set_response(response);
            return ItemStatus::Failed;
        }
    };

    let base = ExtractionBase::of(item.node(root).url());
    let attached = match base {
        Some(base) => extract_and_attach(config, item, root, &base, &response, &bytes),
        None => 0,
    };
    item.node_mut(root).url_mut().set_response(response);

    if attached == 0 {
        ItemStatus::PostProcessed
    } else {
        ItemStatus::GotChildren
    }
}

/// Post-processes URLs attached to the item (redirection targets or child
/// URLs handed over by the archiver). Redirects are NOT followed for
/// these.
async fn process_attached_urls(
    config: &Config,
    item: &mut Item,
    root: NodeId,
    urls: Vec<Url>,
    kind: UrlKind,
) -> ItemStatus {
    let short_id = item.node(root).short_id().to_string();
    let mut attached_total = 0;
    let mut urls = urls.into_iter();

    while let Some(mut url) = urls.next() {
        let Some(mut response) = url.take_response() else {
            debug!(item = %short_id, url = url.raw(), "attached url carries no response, skipping");
            continue;
        };

        // TODO: execute asset redirection once the archiver can re-enter
        // attached URLs; until then log and move on rather than follow.
        if response.is_redirect() {
            warn!(item = %short_id, url = url.raw(), kind = %kind, "redirect on attached url not followed");
            drain_body(&mut response, &short_id).await;
            continue;
        }

        if item.node(root).children_captured() > 0
            || (config.disable_assets_capture && url.hops() >= config.max_hops)
        {
            drain_body(&mut response, &short_id).await;
            drain_remaining(urls, &short_id).await;
            return ItemStatus::Failed;
        }

        let bytes = match response.body_mut().buffer().await {
            Ok(bytes) => bytes,
            Err(buffer_error) => {
                error!(item = %short_id, error = %buffer_error, "unable to read response body");
                item.set_error(root, format!("unable to read response body: {buffer_error}"));
                drain_remaining(urls, &short_id).await;
                return ItemStatus::Failed;
            }
        };

        if url.parse().is_ok() {
            if let Some(base) = ExtractionBase::of(&url) {
                attached_total += extract_and_attach(config, item, root, &base, &response, &bytes);
            }
        }
    }

    if attached_total == 0 {
        ItemStatus::PostProcessed
    } else {
        ItemStatus::GotChildren
    }
}

/// Resolution context for one extraction pass.
struct ExtractionBase {
    parsed: url::Url,
    hops: u32,
}

impl ExtractionBase {
    fn of(url: &Url) -> Option<Self> {
        Some(Self {
            parsed: url.parsed()?.clone(),
            hops: url.hops(),
        })
    }
}

/// Runs the extractors over one buffered response and attaches every
/// discovered reference as a child of `parent`. Returns the number of
/// children attached.
fn extract_and_attach(
    config: &Config,
    item: &mut Item,
    parent: NodeId,
    base: &ExtractionBase,
    response: &Response,
    bytes: &Bytes,
) -> usize {
    let content_type = response.header("content-type").unwrap_or_default();
    let body_text = String::from_utf8_lossy(bytes);

    let mut outlinks = Vec::new();
    let mut assets = Vec::new();

    if content_type.contains("html") {
        let refs = extract_html(&body_text, &base.parsed);
        outlinks = refs.outlinks;
        assets = refs.assets;
    } else {
        debug!(content_type, "no dom extractor for content type");
    }

    if let Some(link_header) = response.header("link") {
        assets.extend(extract_link_header(link_header));
    }
    assets.extend(extract_with_regex(&body_text, &base.parsed));

    // One dedupe set across both kinds; a URL found as an outlink is not
    // attached a second time as an asset.
    let mut seen: HashSet<String> = HashSet::new();
    let mut attached = 0;

    for outlink in outlinks {
        if !seen.insert(outlink.clone()) {
            continue;
        }
        let delta = outlink_hop_delta(config, base, &outlink);
        match item.add_child(parent, Url::new(outlink), UrlKind::Seed, delta) {
            Ok(_) => attached += 1,
            Err(error) => error!(%error, "failed to attach outlink"),
        }
    }
    // Assets do not increment the hop count.
    for asset in assets {
        if !seen.insert(asset.clone()) {
            continue;
        }
        match item.add_child(parent, Url::new(asset), UrlKind::Asset, 0) {
            Ok(_) => attached += 1,
            Err(error) => error!(%error, "failed to attach asset"),
        }
    }

    attached
}

/// Hop delta for a discovered outlink.
///
/// Depth-0 same-domain outlinks inherit the parent's hop count when
/// `domains_crawl` is on (subdomains count: the outlink host need only
/// contain the parent host); everything else increments.
fn outlink_hop_delta(config: &Config, base: &ExtractionBase, outlink: &str) -> u32 {
    if config.domains_crawl && base.hops == 0 {
        let parent_host = base.parsed.host_str();
        let outlink_host = url::Url::parse(outlink)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string));
        if let (Some(parent_host), Some(outlink_host)) = (parent_host, outlink_host) {
            if outlink_host.contains(parent_host) {
                return 0;
            }
        }
    }
    1
}

/// Drains a body, logging instead of failing: the drain is a cleanup
/// obligation, not part of the item's outcome.
async fn drain_body(response: &mut Response, short_id: &str) {
    if let Err(error) = response.body_mut().drain().await {
        error!(item = %short_id, %error, "unable to drain response body");
    }
}

/// Drains the bodies of URLs abandoned by an early exit so no stream is
/// left unread.
async fn drain_remaining(urls: impl Iterator<Item = Url>, short_id: &str) {
    for mut url in urls {
        if let Some(mut response) = url.take_response() {
            drain_body(&mut response, short_id).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use http::HeaderMap;

    use super::*;
    use crate::models::{Body, ItemSource};

    fn html_response(body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        Response::new(200, headers, Body::from_bytes(body.as_bytes().to_vec()))
    }

    fn redirect_response(location: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("location", location.parse().unwrap());
        Response::new(302, headers, Body::empty())
    }

    /// Builds an archived item with the given response attached.
    fn archived_item(raw: &str, response: Response) -> Item {
        let mut item = Item::new_seed(Url::new(raw), None, ItemSource::Queue);
        let root = item.root();
        item.node_mut(root).url_mut().parse().unwrap();
        item.set_status(root, ItemStatus::PreProcessed).unwrap();
        item.node_mut(root).url_mut().set_response(response);
        item.set_status(root, ItemStatus::Archived).unwrap();
        item
    }

    fn child_values(item: &Item) -> Vec<(&str, u32)> {
        item.node(item.root())
            .children()
            .iter()
            .map(|&child| {
                let node = item.node(child);
                (node.url().raw(), node.url().hops())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_seed_with_two_assets() {
        let config = Config {
            domains_crawl: true,
            ..Config::default()
        };
        let mut item = archived_item(
            "http://ex/",
            html_response(r#"<a href="/a">x</a><img src="/b.png">"#),
        );

        postprocess(&config, &mut item).await;

        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::GotChildren);
        assert_eq!(
            child_values(&item),
            vec![("http://ex/a", 0), ("http://ex/b.png", 0)]
        );
        // The body was buffered: still replayable for the sink.
        assert!(item.node(root).url().response().unwrap().body().is_consumed());
        assert!(item.node(root).url().response().unwrap().body().bytes().is_some());
    }

    #[tokio::test]
    async fn test_same_host_outlink_inherits_hops_with_domains_crawl() {
        let config = Config {
            domains_crawl: true,
            ..Config::default()
        };
        let mut item = archived_item(
            "http://ex.com/",
            html_response(r#"<a href="http://api.ex.com/v1">api</a>"#),
        );

        postprocess(&config, &mut item).await;

        assert_eq!(child_values(&item), vec![("http://api.ex.com/v1", 0)]);
    }

    #[tokio::test]
    async fn test_outlink_increments_hops_without_domains_crawl() {
        let config = Config {
            domains_crawl: false,
            ..Config::default()
        };
        let mut item = archived_item(
            "http://ex.com/",
            html_response(r#"<a href="http://api.ex.com/v1">api</a>"#),
        );

        postprocess(&config, &mut item).await;

        assert_eq!(child_values(&item), vec![("http://api.ex.com/v1", 1)]);
    }

    #[tokio::test]
    async fn test_redirect_within_limit_attaches_target() {
        let config = Config::default();
        let mut item = archived_item("http://ex/", redirect_response("http://ex/b"));

        postprocess(&config, &mut item).await;

        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::GotRedirected);
        let redirection = item.node(root).redirection().unwrap();
        assert_eq!(redirection.raw(), "http://ex/b");
        assert_eq!(redirection.redirects(), 1);
        assert_eq!(redirection.hops(), 0);
        // No children for a redirect.
        assert!(item.node(root).children().is_empty());
    }

    #[tokio::test]
    async fn test_redirect_over_limit_fails_without_emitting() {
        let config = Config {
            max_redirect: 2,
            ..Config::default()
        };
        let mut item = Item::new_seed(
            Url::new("http://ex/loop").with_redirects(2),
            None,
            ItemSource::Feedback,
        );
        let root = item.root();
        item.node_mut(root).url_mut().parse().unwrap();
        item.set_status(root, ItemStatus::PreProcessed).unwrap();
        item.node_mut(root)
            .url_mut()
            .set_response(redirect_response("http://ex/again"));
        item.set_status(root, ItemStatus::Archived).unwrap();

        postprocess(&config, &mut item).await;

        assert_eq!(item.node(root).status(), ItemStatus::Failed);
        assert!(item.node(root).redirection().is_none());
        assert!(item.node(root).children().is_empty());
    }

    #[tokio::test]
    async fn test_redirect_without_location_fails() {
        let config = Config::default();
        let response = Response::new(301, HeaderMap::new(), Body::empty());
        let mut item = archived_item("http://ex/", response);

        postprocess(&config, &mut item).await;

        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::Failed);
        assert!(item.node(root).err().unwrap().contains("Location"));
    }

    #[tokio::test]
    async fn test_assets_capture_cutoff_drains_and_fails() {
        let config = Config {
            disable_assets_capture: true,
            max_hops: 0,
            ..Config::default()
        };
        let mut item = archived_item("http://ex/", html_response("<a href=\"/a\">x</a>"));

        postprocess(&config, &mut item).await;

        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::Failed);
        assert!(item.node(root).children().is_empty());
        // Body was drained, not buffered.
        let response = item.node(root).url().response().unwrap();
        assert!(response.body().is_consumed());
        assert!(response.body().bytes().is_none());
    }

    #[tokio::test]
    async fn test_children_captured_by_archiver_short_circuits() {
        let config = Config::default();
        let mut item = archived_item("http://ex/", html_response("<a href=\"/a\">x</a>"));
        item.node_mut(item.root()).set_children_captured(3);

        postprocess(&config, &mut item).await;

        assert_eq!(item.node(item.root()).status(), ItemStatus::Failed);
        assert!(item.node(item.root()).children().is_empty());
    }

    #[tokio::test]
    async fn test_plain_page_ends_postprocessed() {
        let config = Config::default();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        let response = Response::new(
            200,
            headers,
            Body::from_bytes(b"nothing to see".to_vec()),
        );
        let mut item = archived_item("http://ex/robots.txt", response);

        postprocess(&config, &mut item).await;

        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::PostProcessed);
        assert!(item.node(root).children().is_empty());
        assert!(item.node(root).url().response().unwrap().body().is_consumed());
    }

    #[tokio::test]
    async fn test_link_header_urls_are_attached() {
        let config = Config::default();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert(
            "link",
            r#"<http://a/>; rel="next", <http://b/>; rel="prev""#.parse().unwrap(),
        );
        let response = Response::new(200, headers, Body::from_bytes(b"".to_vec()));
        let mut item = archived_item("http://ex/", response);

        postprocess(&config, &mut item).await;

        let root = item.root();
        assert_eq!(item.node(root).status(), ItemStatus::GotChildren);
        assert_eq!(
            child_values(&item),
            vec![("http://a/", 0), ("http://b/", 0)]
        );
    }

    #[tokio::test]
    async fn test_attached_asset_redirect_is_not_followed() {
        let config = Config::default();
        let mut item = archived_item("http://ex/", html_response(""));
        // Simulate the archiver handing over a child whose fetch bounced.
        let mut asset = Url::new("http://ex/style.css");
        asset.set_response(redirect_response("http://cdn.ex/style.css"));
        item.node_mut(item.root()).push_pending_child(asset);

        postprocess(&config, &mut item).await;

        let root = item.root();
        // The redirect was not followed and nothing was attached.
        assert_eq!(item.node(root).status(), ItemStatus::PostProcessed);
        assert!(item.node(root).redirection().is_none());
        assert!(item.node(root).children().is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_passes_through_handler() {
        let mut item = Item::new_seed(Url::new("http://ex/"), None, ItemSource::Queue);
        let root = item.root();
        item.set_status(root, ItemStatus::Failed).unwrap();

        let handler = Postprocessor::new(
            Arc::new(Config::default()),
            Arc::new(PipelineStats::new()),
        );
        let item = handler.handle(item).await;
        assert_eq!(item.node(item.root()).status(), ItemStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_references_attach_once() {
        let config = Config {
            domains_crawl: true,
            ..Config::default()
        };
        let mut item = archived_item(
            "http://ex/",
            html_response(r#"<a href="/a">1</a><a href="/a">2</a><img src="/a">"#),
        );

        postprocess(&config, &mut item).await;

        assert_eq!(child_values(&item), vec![("http://ex/a", 0)]);
    }
}
