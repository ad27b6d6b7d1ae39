//! End-to-end pipeline tests: a stub fetcher, a real local queue, and the
//! full supervisor wiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use magpie::models::{Body, Response, Url};
use magpie::source::{LocalQueue, QueuedUrl, UrlSource};
use magpie::{Config, FetchError, Fetcher, Supervisor};
use tempfile::TempDir;

/// Fetcher stub serving canned responses by exact URL; unknown URLs get
/// an empty plain-text 200.
struct StubFetcher {
    pages: HashMap<String, (u16, Vec<(&'static str, String)>, &'static str)>,
}

impl StubFetcher {
    fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    fn html(mut self, url: &str, body: &'static str) -> Self {
        self.pages.insert(
            url.to_string(),
            (200, vec![("content-type", "text/html".to_string())], body),
        );
        self
    }

    fn redirect(mut self, url: &str, location: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            (302, vec![("location", location.to_string())], ""),
        );
        self
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &Url) -> Result<Response, FetchError> {
        let (status, header_pairs, body) = self
            .pages
            .get(url.raw())
            .cloned()
            .unwrap_or((200, vec![("content-type", "text/plain".to_string())], ""));

        let mut headers = HeaderMap::new();
        for (name, value) in header_pairs {
            headers.insert(
                http::header::HeaderName::from_static(name),
                value.parse().map_err(|_| FetchError::Protocol("bad header".to_string()))?,
            );
        }
        // Serve through a reader so the body is a real read-once stream.
        Ok(Response::new(
            status,
            headers,
            Body::from_reader(std::io::Cursor::new(body.as_bytes().to_vec())),
        ))
    }
}

/// Fetcher stub that answers slowly, for cancellation tests.
struct SlowFetcher;

#[async_trait]
impl Fetcher for SlowFetcher {
    async fn fetch(&self, _url: &Url) -> Result<Response, FetchError> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(Response::new(200, HeaderMap::new(), Body::empty()))
    }
}

async fn queue_with_seeds(temp_dir: &TempDir, seeds: &[&str]) -> LocalQueue {
    let queue = LocalQueue::open(temp_dir.path()).await.unwrap();
    let urls: Vec<QueuedUrl> = seeds
        .iter()
        .map(|value| QueuedUrl::seed(*value, Some("test".to_string())))
        .collect();
    queue.add(urls, false).await.unwrap();
    queue
}

fn small_config(temp_dir: &TempDir) -> Config {
    Config {
        workers_count: 2,
        domains_crawl: true,
        job_path: temp_dir.path().to_path_buf(),
        pull_batch_size: 5,
        channel_capacity: 8,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_seed_with_two_assets_crawls_to_exhaustion() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/"]).await;
    let fetcher = StubFetcher::new().html("http://ex/", r#"<a href="/a">x</a><img src="/b.png">"#);

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(small_config(&temp_dir), source, Arc::new(fetcher));
    let stats = supervisor.stats();

    supervisor.run().await.unwrap();

    // The seed and both discovered children were crawled and acknowledged.
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.pulled, 3);
    assert_eq!(snapshot.completed, 3);
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.children_discovered, 2);

    assert_eq!(queue.count_by_status("done").await.unwrap(), 3);
    assert_eq!(queue.count_by_status("fresh").await.unwrap(), 0);
    assert_eq!(queue.count_by_status("claimed").await.unwrap(), 0);
}

#[tokio::test]
async fn test_redirect_chain_is_followed_to_completion() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/old"]).await;
    let fetcher = StubFetcher::new().redirect("http://ex/old", "http://ex/new");

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(small_config(&temp_dir), source, Arc::new(fetcher));
    let stats = supervisor.stats();

    supervisor.run().await.unwrap();

    let snapshot = stats.snapshot();
    // One durable row pulled; the redirect target continued the same item.
    assert_eq!(snapshot.pulled, 1);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.failed, 0);
    // Both the original and the target went through the archive stage.
    assert_eq!(snapshot.archived, 2);

    assert_eq!(queue.count_by_status("done").await.unwrap(), 1);
}

#[tokio::test]
async fn test_redirect_loop_fails_at_the_limit() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/loop"]).await;
    // A self-redirect keeps bouncing until the cutoff.
    let fetcher = StubFetcher::new().redirect("http://ex/loop", "http://ex/loop");

    let mut config = small_config(&temp_dir);
    config.max_redirect = 2;

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(config, source, Arc::new(fetcher));
    let stats = supervisor.stats();

    supervisor.run().await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.completed, 0);
    // Original fetch plus max_redirect follow-ups.
    assert_eq!(snapshot.archived, 3);
    // The row is acknowledged even though the item failed.
    assert_eq!(queue.count_by_status("done").await.unwrap(), 1);
}

#[tokio::test]
async fn test_unparseable_seed_fails_but_is_acknowledged() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["not a url at all"]).await;

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(
        small_config(&temp_dir),
        source,
        Arc::new(StubFetcher::new()),
    );
    let stats = supervisor.stats();

    supervisor.run().await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.completed, 0);
    assert_eq!(snapshot.archived, 0);
    assert_eq!(queue.count_by_status("done").await.unwrap(), 1);
}

#[tokio::test]
async fn test_hop_limit_stops_outlink_reenqueue() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/"]).await;
    // The outlink goes off-host, so it would get hops = 1.
    let fetcher = StubFetcher::new().html("http://ex/", r#"<a href="http://other.org/">o</a>"#);

    let mut config = small_config(&temp_dir);
    config.max_hops = 0;

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(config, source, Arc::new(fetcher));
    let stats = supervisor.stats();

    supervisor.run().await.unwrap();

    let snapshot = stats.snapshot();
    // The child was discovered but never re-enqueued.
    assert_eq!(snapshot.children_discovered, 1);
    assert_eq!(snapshot.pulled, 1);
    assert_eq!(queue.count_by_status("done").await.unwrap(), 1);
    assert_eq!(queue.count_by_status("fresh").await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancellation_leaves_claimed_rows_for_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/slow"]).await;

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(small_config(&temp_dir), source, Arc::new(SlowFetcher));
    let cancel = supervisor.cancellation_token();

    let run = tokio::spawn(supervisor.run());
    // Give the pipeline time to claim and dispatch the seed, then stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    // The in-flight item was abandoned; its row is still claimed and
    // recovers on the next run.
    assert_eq!(queue.count_by_status("claimed").await.unwrap(), 1);
    assert_eq!(queue.reset_claimed().await.unwrap(), 1);
    assert_eq!(queue.count_by_status("fresh").await.unwrap(), 1);
}

#[tokio::test]
async fn test_outlinks_route_to_sink_when_kafka_is_configured() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/"]).await;
    let fetcher = StubFetcher::new().html(
        "http://ex/",
        r#"<a href="http://other.org/p">o</a><img src="/logo.png">"#,
    );

    let mut config = small_config(&temp_dir);
    config.domains_crawl = false;
    config.max_hops = 5;
    config.use_kafka = true;
    config.kafka_outlinks_topic = Some("outlinks".to_string());

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let mut supervisor = Supervisor::new(config, source, Arc::new(fetcher));
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(16);
    supervisor.route_outlinks_to(sink_tx);

    supervisor.run().await.unwrap();

    // The outlink went to the topic...
    let routed = sink_rx.recv().await.unwrap();
    assert_eq!(routed.value, "http://other.org/p");
    assert_eq!(routed.hops, 1);
    // ...while the asset stayed on the local frontier and was crawled.
    assert_eq!(queue.count_by_status("done").await.unwrap(), 2);
}

#[tokio::test]
async fn test_wide_fanout_drains_completely() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with_seeds(&temp_dir, &["http://ex/"]).await;

    // One page linking to twenty others, all on-host.
    let body: &'static str = Box::leak(
        (0..20)
            .map(|index| format!(r##"<a href="/page/{index}">p</a>"##))
            .collect::<String>()
            .into_boxed_str(),
    );
    let fetcher = StubFetcher::new().html("http://ex/", body);

    let source: Arc<dyn UrlSource> = Arc::new(queue.clone());
    let supervisor = Supervisor::new(small_config(&temp_dir), source, Arc::new(fetcher));
    let stats = supervisor.stats();

    supervisor.run().await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.pulled, 21);
    assert_eq!(snapshot.completed, 21);
    assert_eq!(queue.count_by_status("done").await.unwrap(), 21);
}
