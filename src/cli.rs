//! Command-line interface definitions for the publication crawler.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Flags override values from the optional YAML configuration file; the
//! listing URL and keyword can also come from the environment.

use crate::config::CrawlConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the publication crawler.
///
/// # Examples
///
/// ```sh
/// # Fresh crawl into publications.csv
/// publication_crawler run
///
/// # Pick up where an interrupted crawl stopped
/// publication_crawler run --resume -o data/heart.csv
///
/// # Check that the site still parses
/// publication_crawler probe --keyword stroke
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a crawl.yaml configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dataset table; the progress file and JSON snapshot are written next to it
    #[arg(short, long, global = true, default_value = "publications.csv")]
    pub output: PathBuf,

    /// Listing endpoint
    #[arg(long, env = "CRAWLER_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Search keyword
    #[arg(short, long, env = "CRAWLER_KEYWORD", global = true)]
    pub keyword: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl every listing page and the details of each article
    Run(RunArgs),
    /// Re-fetch details for records without an abstract
    RetryAbstracts,
    /// Fetch page 1 and its first article and print what was extracted
    Probe,
    /// Write a snapshot of the existing dataset
    Export(ExportArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Continue from the progress file instead of starting over
    #[arg(short, long)]
    pub resume: bool,

    /// Listing pages processed in parallel
    #[arg(short, long)]
    pub page_concurrency: Option<usize>,

    /// Article detail pages fetched in parallel per listing page
    #[arg(short, long)]
    pub article_concurrency: Option<usize>,

    /// Drop every stored record before crawling
    #[arg(long)]
    pub reset_dataset: bool,
}

#[derive(Args, Debug, Default)]
pub struct ExportArgs {
    /// Destination (defaults to the dataset path with a .json extension)
    #[arg(long)]
    pub to: Option<PathBuf>,

    /// Write the table format instead of JSON
    #[arg(long)]
    pub table: bool,
}

impl Cli {
    /// Fold flag values over `config`.
    pub fn apply(&self, config: &mut CrawlConfig) {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(keyword) = &self.keyword {
            config.keyword = keyword.clone();
        }
        if let Command::Run(run) = &self.command {
            if let Some(n) = run.page_concurrency {
                config.page_concurrency = n;
            }
            if let Some(n) = run.article_concurrency {
                config.article_concurrency = n;
            }
        }
    }
}
