pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod extract;
pub mod geo;
pub mod listings;
pub mod normalize;
pub mod orchestrator;
pub mod reconcile;
pub mod resolver;
pub mod retry;
pub mod session;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::checkpoint::CheckpointStore;
use crate::geo::BoundingBox;
use crate::listings::ListingTable;
use crate::orchestrator::{BatchOrchestrator, ListingGeocoder};
use crate::resolver::CoordinateResolver;
use crate::session::SessionPool;

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::orchestrator::{BatchProgress, ProgressObserver, RunSummary};
pub use crate::reconcile::ReconcileStats;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run: RunSummary,
    pub reconcile: ReconcileStats,
    pub output: PathBuf,
}

/// Geocodes every listing not yet in the checkpoint, then rewrites the final
/// table from the full checkpoint.
pub async fn run_pipeline(
    config: &AppConfig,
    input: &Path,
    checkpoint: &Path,
    output: Option<&Path>,
    observer: Option<ProgressObserver>,
) -> AppResult<PipelineReport> {
    info!(
        config = %serde_json::to_string(&config.public_profile())?,
        "pipeline configuration"
    );
    let table = ListingTable::load(input)?;
    info!(
        input = %input.display(),
        rows = table.row_count(),
        listings = table.len(),
        "loaded listings"
    );

    let store = Arc::new(CheckpointStore::open(checkpoint)?);
    let sessions = Arc::new(SessionPool::new(config.session_settings())?);
    let resolver = CoordinateResolver::new(config, sessions)?;
    info!(strategies = ?resolver.strategy_names(), "resolver ready");
    if config.google_geocoding_api_key.is_none() {
        warn!("no geocoding api key configured; using search page scraping only");
    }

    let geocoder = Arc::new(ListingGeocoder::new(
        resolver,
        config.retry_policy(),
        config.bounds,
        config.required_address_fragment.clone(),
    ));
    let orchestrator = BatchOrchestrator::new(geocoder, Arc::clone(&store), config.batch_settings());
    let run = orchestrator.run(&table.listings, observer).await?;

    let output = resolve_output(input, checkpoint, output);
    let reconcile = reconcile::reconcile_files(&table, store.path(), &output, &config.bounds)?;
    Ok(PipelineReport {
        run,
        reconcile,
        output,
    })
}

/// Rebuilds the final table from whatever the checkpoint holds right now.
pub fn reconcile_only(
    input: &Path,
    checkpoint: &Path,
    output: Option<&Path>,
    bounds: &BoundingBox,
) -> AppResult<(PathBuf, ReconcileStats)> {
    let table = ListingTable::load(input)?;
    let output = resolve_output(input, checkpoint, output);
    let stats = reconcile::reconcile_files(&table, checkpoint, &output, bounds)?;
    Ok((output, stats))
}

fn resolve_output(input: &Path, checkpoint: &Path, output: Option<&Path>) -> PathBuf {
    output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| reconcile::default_output_path(input, checkpoint))
}

pub fn init_tracing(log_file: Option<&Path>) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,listing_geocoder=debug"));
        let file = log_file.map(|path| OpenOptions::new().create(true).append(true).open(path));
        let (file_layer, file_error) = match file {
            Some(Ok(file)) => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                ),
                None,
            ),
            Some(Err(err)) => (None, Some(err)),
            None => (None, None),
        };
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(file_layer)
            .init();
        if let Some(err) = file_error {
            warn!(?err, "unable to open log file; logging to stdout only");
        }
    });
}
