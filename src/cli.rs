//! CLI argument definitions using clap derive macros.
//!
//! The command-line surface is deliberately thin: seeds in, a few config
//! overrides, everything else in the TOML config file.

use std::path::PathBuf;

use clap::Parser;

/// Archive the web, one seed at a time.
#[derive(Parser, Debug)]
#[command(name = "magpie")]
#[command(author, version, about)]
pub struct Cli {
    /// Seed URLs to enqueue before the crawl starts.
    pub seeds: Vec<String>,

    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Job directory (overrides the config file).
    #[arg(long)]
    pub job_path: Option<PathBuf>,

    /// Per-stage worker concurrency (overrides the config file).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Seed depth limit (overrides the config file).
    #[arg(long)]
    pub max_hops: Option<u32>,

    /// Provenance string recorded for the seeds given on the command line.
    #[arg(long, default_value = "cli")]
    pub seeds_via: String,
}
