//! # Publication Crawler
//!
//! A resumable, concurrent crawler for a paginated publication listing. It
//! walks every listing page of a keyword search, fetches each article's
//! detail page, and keeps a deduplicated dataset (CSV plus a JSON snapshot)
//! together with a progress file so an interrupted crawl can pick up where
//! it stopped.
//!
//! ## Features
//!
//! - Two-level bounded concurrency: listing pages, then articles per page
//! - Crash-safe progress and dataset files (write to temp, then rename)
//! - Upsert by canonical article link; reruns never duplicate rows
//! - Compensation pass over failed pages and incomplete records
//! - Cooperative Ctrl-C handling that drains in-flight pages before exiting
//!
//! ## Usage
//!
//! ```sh
//! publication_crawler run --output publications.csv
//! publication_crawler run --resume
//! publication_crawler retry-abstracts
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: read the result count from listing page 1
//! 2. **Planning**: failed pages first, then pages never completed
//! 3. **Sweep**: pages in parallel, article details in parallel per page
//! 4. **Compensation**: retry failed pages and incomplete details
//! 5. **Output**: progress file, dataset table, JSON snapshot, summary

use clap::Parser;
use std::error::Error;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod error;
mod extractor;
mod fetcher;
mod models;
mod orchestrator;
mod progress;
mod retry;
mod store;
mod utils;

use cli::{Cli, Command, ExportArgs, RunArgs};
use config::CrawlConfig;
use extractor::PublicationsExtractor;
use fetcher::HttpFetcher;
use orchestrator::Orchestrator;
use progress::ProgressStore;
use store::{DatasetStore, ExportFormat};
use utils::{ensure_writable_parent, json_path_for, progress_path_for};

/// Exit status when pages are left failed or pending.
const EXIT_UNFINISHED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    info!(command = ?args.command, output = %args.output.display(), "publication_crawler starting up");

    let code = match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Crawler failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    };

    let elapsed = start_time.elapsed();
    info!(?elapsed, secs = elapsed.as_secs(), "Execution complete");
    code
}

async fn execute(args: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let mut config = CrawlConfig::load(args.config.as_deref()).await?;
    args.apply(&mut config);
    let config = config.validate()?;
    info!(filters = %config.filters(), encoding = config.encoding.label(), "Configuration ready");

    match &args.command {
        Command::Run(run) => run_crawl(&args.output, run, config).await,
        Command::RetryAbstracts => retry_abstracts(&args.output, config).await,
        Command::Probe => probe(&args.output, config).await,
        Command::Export(export) => export_dataset(&args.output, export, config).await,
    }
}

async fn build_orchestrator(config: CrawlConfig, output: &Path) -> Result<Orchestrator, Box<dyn Error>> {
    let dataset = DatasetStore::open(output, config.encoding).await?;
    let fetcher = HttpFetcher::new(&config)?;
    let extractor = PublicationsExtractor::new(&config.base_url)?;
    Ok(Orchestrator::new(
        config,
        Arc::new(fetcher),
        Arc::new(extractor),
        Arc::new(dataset),
        ProgressStore::new(progress_path_for(output)),
    ))
}

/// Cancel `token` on Ctrl-C. Abort the handle once the guarded work is done.
fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight work before exiting");
            token.cancel();
        }
    })
}

#[instrument(level = "info", skip_all, fields(output = %output.display(), resume = run.resume))]
async fn run_crawl(output: &Path, run: &RunArgs, config: CrawlConfig) -> Result<ExitCode, Box<dyn Error>> {
    // Early check: the dataset, progress file and snapshot all live here.
    if let Err(e) = ensure_writable_parent(output).await {
        error!(
            path = %output.display(),
            error = %e,
            "Output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    if !run.resume {
        ProgressStore::new(progress_path_for(output)).clear().await?;
    }
    let page_concurrency = config.page_concurrency;
    let orchestrator = build_orchestrator(config, output).await?;
    if run.reset_dataset {
        orchestrator.dataset().reset().await?;
    }

    let interrupt = cancel_on_interrupt(orchestrator.cancellation_token());
    let outcome = orchestrator.run(page_concurrency).await;
    interrupt.abort();
    let leftover = orchestrator.sessions().release_all().await;
    info!(
        sessions_opened = orchestrator.sessions().opened_count(),
        leftover,
        "Fetch sessions released"
    );
    let summary = outcome?;

    let json_path = json_path_for(output);
    orchestrator.dataset().export(ExportFormat::Json, &json_path).await?;

    println!("{summary}");
    if summary.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(
            failed = summary.failed_pages.len(),
            pending = summary.pending_pages.len(),
            cancelled = summary.cancelled,
            "Crawl unfinished; rerun with --resume"
        );
        Ok(ExitCode::from(EXIT_UNFINISHED))
    }
}

#[instrument(level = "info", skip_all, fields(output = %output.display()))]
async fn retry_abstracts(output: &Path, config: CrawlConfig) -> Result<ExitCode, Box<dyn Error>> {
    let orchestrator = build_orchestrator(config, output).await?;
    if orchestrator.dataset().len().await == 0 {
        warn!("Dataset is empty; nothing to retry");
        return Ok(ExitCode::SUCCESS);
    }

    let interrupt = cancel_on_interrupt(orchestrator.cancellation_token());
    let outcome = orchestrator.retry_missing_abstracts().await;
    interrupt.abort();
    orchestrator.sessions().release_all().await;
    let tally = outcome?;

    orchestrator
        .dataset()
        .export(ExportFormat::Json, &json_path_for(output))
        .await?;
    let stats = orchestrator.dataset().stats().await;
    println!("Abstracts recovered:  {}", tally.fetched);
    println!("Still not found:      {}", tally.not_found);
    println!("Fetch failures:       {}", tally.failed);
    println!("Rows with abstract:   {}/{}", stats.with_abstract, stats.rows);
    Ok(ExitCode::SUCCESS)
}

#[instrument(level = "info", skip_all)]
async fn probe(output: &Path, config: CrawlConfig) -> Result<ExitCode, Box<dyn Error>> {
    let orchestrator = build_orchestrator(config, output).await?;
    let report = orchestrator.probe().await?;
    println!("{report}");
    Ok(ExitCode::SUCCESS)
}

#[instrument(level = "info", skip_all, fields(output = %output.display()))]
async fn export_dataset(
    output: &Path,
    export: &ExportArgs,
    config: CrawlConfig,
) -> Result<ExitCode, Box<dyn Error>> {
    if !output.exists() {
        return Err(format!("dataset {} does not exist", output.display()).into());
    }
    let dataset = DatasetStore::open(output, config.encoding).await?;
    let (format, default_target) = if export.table {
        (ExportFormat::Table, output.with_extension("export.csv"))
    } else {
        (ExportFormat::Json, json_path_for(output))
    };
    let target = export.to.clone().unwrap_or(default_target);
    let rows = dataset.export(format, &target).await?;
    println!("Exported {rows} records to {}", target.display());
    Ok(ExitCode::SUCCESS)
}
