//! CLI entry point for the magpie crawler.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use magpie::source::{HqClient, QueuedUrl};
use magpie::{Config, HttpFetcher, LocalQueue, Supervisor, UrlSource};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the tracing subscriber from `RUST_LOG`, defaulting to info.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(job_path) = cli.job_path {
        config.job_path = job_path;
    }
    if let Some(workers) = cli.workers {
        config.workers_count = workers;
    }
    if let Some(max_hops) = cli.max_hops {
        config.max_hops = max_hops;
    }
    config.validate()?;

    std::fs::create_dir_all(&config.job_path)
        .with_context(|| format!("failed to create job directory {}", config.job_path.display()))?;

    // Pick the source: the remote coordinator when configured, the local
    // durable queue otherwise.
    let source: Arc<dyn UrlSource> = match &config.hq {
        Some(settings) => {
            info!(address = %settings.address, project = %settings.project, "using remote HQ source");
            Arc::new(HqClient::new(settings)?)
        }
        None => {
            let queue = LocalQueue::open(&config.job_path)
                .await
                .context("failed to open the local queue")?;
            let recovered = queue.reset_claimed().await?;
            if recovered > 0 {
                info!(recovered, "returned claimed urls to fresh from a previous run");
            }
            Arc::new(queue)
        }
    };

    if !cli.seeds.is_empty() {
        let seeds: Vec<QueuedUrl> = cli
            .seeds
            .iter()
            .map(|value| QueuedUrl::seed(value, Some(cli.seeds_via.clone())))
            .collect();
        let count = seeds.len();
        source
            .push(seeds, false)
            .await
            .context("failed to enqueue seeds")?;
        info!(count, "seeds enqueued");
    }

    let fetcher = Arc::new(HttpFetcher::new()?);
    let supervisor = Supervisor::new(config, source, fetcher);

    let cancel = supervisor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down gracefully");
            cancel.cancel();
        }
    });

    let stats = supervisor.stats();
    supervisor.run().await?;

    let snapshot = stats.snapshot();
    info!(%snapshot, "crawl finished");
    Ok(())
}
