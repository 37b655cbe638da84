//! streamload CLI - Fault-tolerant streaming ingestion into analytical stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use streamload::models::SourceConfig;
use streamload::{Config, PipelineState, RunStats, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "streamload")]
#[command(version)]
#[command(about = "Fault-tolerant streaming ingestion into analytical stores via stream load")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervised pipeline
    Run {
        /// Resume from the latest checkpoint in the checkpoint directory
        #[arg(long)]
        resume: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# streamload configuration file

[source]
# Built-in demo feed of (name, score) rows
kind = "generator"
interval_ms = 1000
# limit = 100
#
# Or a delimited text file:
# kind = "file"
# path = "data/rows.csv"
# field_delimiter = ","

[sink]
load_url = "http://master1:8030"
database = "starrocks_demo"
table = "demo2_flink_tb1"
username = "root"
# password = "${STARROCKS_PASSWORD}"
# password_env = "STARROCKS_PASSWORD"
format = "csv"            # or "json"
column_separator = "\\x01"
row_delimiter = "\\x02"
label_prefix = "streamload"
timeout_ms = 60000
max_retries = 3
retry_backoff_ms = 1000
max_backoff_ms = 60000
parallelism = 1

[schema]
columns = [
    { name = "name", type = "varchar", length = 20 },
    { name = "score", type = "int" },
]

[transform]
on_error = "fail"         # or "skip"

[buffer]
flush_interval_ms = 5000
max_rows = 500000
max_bytes = 94371840

[checkpoint]
dir = "checkpoints"
interval_ms = 30000
timeout_ms = 600000
max_concurrent = 1
min_pause_ms = 500
# tolerable_failures = 10
retention = "delete_on_cancellation"   # or "retain_on_cancellation"

[restart]
max_failures = 3
failure_window_ms = 300000
delay_ms = 10000
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    let config =
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_summary(stats: &RunStats, state: &str) {
    println!("\n=== Pipeline {state} ===");
    println!("Records read:    {}", stats.records_read);
    println!("Records skipped: {}", stats.records_skipped);
    println!("Rows loaded:     {}", stats.rows_loaded);
    println!(
        "Batches:         {} ({} duplicate)",
        stats.batches_loaded, stats.duplicate_batches
    );
    println!("Load retries:    {}", stats.load_retries);
    println!(
        "Checkpoints:     {} ({} failed)",
        stats.checkpoints_completed, stats.checkpoints_failed
    );
    println!("Restarts:        {}", stats.restarts);
    println!("Throughput:      {:.0} rows/s", stats.throughput_per_sec);
    println!("Runtime:         {:.1}s", stats.runtime_secs);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config
                .resolve_password()
                .context("Failed to resolve sink password")?;

            info!("Configuration is valid");
            match &config.source {
                SourceConfig::Generator { interval_ms, limit } => {
                    info!("  Source: generator every {interval_ms}ms, limit {limit:?}")
                }
                SourceConfig::File { path, .. } => info!("  Source: file {path:?}"),
            }
            info!(
                "  Sink: {}/{}.{} ({:?}, parallelism {})",
                config.sink.load_url,
                config.sink.database,
                config.sink.table,
                config.sink.format,
                config.sink.parallelism
            );
            info!(
                "  Flush: {} rows, {} bytes or {}ms",
                config.buffer.max_rows, config.buffer.max_bytes, config.buffer.flush_interval_ms
            );
            info!(
                "  Restart: {} failures per {}ms, delay {}ms",
                config.restart.max_failures,
                config.restart.failure_window_ms,
                config.restart.delay_ms
            );
            return Ok(());
        }

        Commands::Run { resume } => {
            let config = Arc::new(load_config(&cli.config)?);
            let supervisor =
                Supervisor::from_config(config).context("Failed to set up pipeline")?;
            let stats = supervisor.stats();
            let started = std::time::Instant::now();
            let mut state = supervisor.state();

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C, shutting down");
                    on_signal.cancel();
                }
            });

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} [{elapsed_precise}] {msg}")
                    .context("Invalid progress template")?,
            );
            spinner.enable_steady_tick(Duration::from_millis(200));
            let progress_stats = supervisor.stats();
            let progress_spinner = spinner.clone();
            let progress = tokio::spawn(async move {
                loop {
                    let phase = match *state.borrow_and_update() {
                        PipelineState::Running => "running",
                        PipelineState::Restarting => "restarting",
                        PipelineState::StoppedClean | PipelineState::StoppedFailed => break,
                    };
                    progress_spinner.set_message(format!(
                        "{phase}: {} read, {} loaded in {} batches",
                        progress_stats.records_read.load(Ordering::Relaxed),
                        progress_stats.rows_loaded.load(Ordering::Relaxed),
                        progress_stats.batches_loaded.load(Ordering::Relaxed),
                    ));
                    tokio::select! {
                        changed = state.changed() => if changed.is_err() { break },
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    }
                }
            });

            let result = supervisor.run(resume, shutdown).await;
            progress.abort();
            spinner.finish_and_clear();

            match result {
                Ok(report) => {
                    info!(run_id = %report.run_id, last_checkpoint = ?report.last_checkpoint, "Pipeline stopped");
                    print_summary(&report.stats, "Stopped");
                }
                Err(e) => {
                    print_summary(&stats.snapshot(started.elapsed().as_secs_f64()), "Failed");
                    warn!("Checkpoints left in place, rerun with --resume to continue");
                    return Err(e).context("Pipeline failed");
                }
            }
        }
    }

    Ok(())
}
