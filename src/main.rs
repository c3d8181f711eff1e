use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing::info;

use listing_geocoder::{
    init_tracing, reconcile_only, run_pipeline, AppConfig, BatchProgress, ProgressObserver,
};

/// Resumable batch geocoder for rental listings.
#[derive(Parser)]
#[command(name = "listing-geocoder", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Geocode pending listings, then write the final table.
    Run(RunArgs),
    /// Write the final table from the current checkpoint without geocoding.
    Reconcile(PathArgs),
}

#[derive(Args)]
struct PathArgs {
    /// Listing table with at least `id` and `address` columns.
    #[arg(long)]
    input: PathBuf,

    /// Append-only progress file; created if missing.
    #[arg(long)]
    checkpoint: PathBuf,

    /// Defaults to `geocoded_<input name>` next to the checkpoint.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    paths: PathArgs,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    request_delay_ms: Option<u64>,

    #[arg(long, env = "GOOGLE_GEOCODING_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size.max(1);
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries.max(1);
        }
        if let Some(delay) = self.request_delay_ms {
            config.request_delay_ms = delay;
        }
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            config.google_geocoding_api_key = Some(SecretString::from(key.to_string()));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // loads .env before clap reads env-backed flags
    let mut config = AppConfig::from_env();
    let cli = Cli::parse();
    init_tracing(config.log_file.as_deref());

    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            let observer: ProgressObserver = Arc::new(|progress: BatchProgress| {
                if progress.completed % 10 == 0 || progress.completed == progress.total {
                    info!(
                        completed = progress.completed,
                        total = progress.total,
                        succeeded = progress.succeeded,
                        failed = progress.failed,
                        "progress"
                    );
                }
            });
            let report = run_pipeline(
                &config,
                &args.paths.input,
                &args.paths.checkpoint,
                args.paths.output.as_deref(),
                Some(observer),
            )
            .await
            .context("geocoding run failed")?;
            info!(
                output = %report.output.display(),
                summary = %serde_json::to_string(&report)?,
                "run complete"
            );
        }
        Command::Reconcile(paths) => {
            let (output, stats) =
                reconcile_only(
                    &paths.input,
                    &paths.checkpoint,
                    paths.output.as_deref(),
                    &config.bounds,
                )
                .context("reconcile failed")?;
            info!(
                output = %output.display(),
                stats = %serde_json::to_string(&stats)?,
                "reconcile complete"
            );
        }
    }
    Ok(())
}
