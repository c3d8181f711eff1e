use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{load_outcomes, GeocodeOutcome, GeocodeStatus, CHECKPOINT_HEADERS};
use crate::errors::{AppError, AppResult};
use crate::geo::BoundingBox;
use crate::listings::ListingTable;

pub const NOT_PROCESSED: &str = "not_processed";

/// Input table with the geocoding columns appended. Any geocoding columns the
/// input already carried are replaced rather than duplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalTable {
    pub headers: StringRecord,
    pub rows: Vec<StringRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub not_processed: usize,
    /// `success / (success + failed)`, absent when nothing was attempted.
    pub success_rate: Option<f64>,
}

impl ReconcileStats {
    fn record(&mut self, status: Option<GeocodeStatus>) {
        self.total += 1;
        match status {
            Some(GeocodeStatus::Success) => self.success += 1,
            Some(GeocodeStatus::Failed) => self.failed += 1,
            None => self.not_processed += 1,
        }
    }

    fn finish(mut self) -> Self {
        let attempted = self.success + self.failed;
        self.success_rate = (attempted > 0).then(|| self.success as f64 / attempted as f64);
        self
    }
}

/// Left join of every source row and the outcomes on listing id. Rows whose id
/// is blank never match; repeated ids share the outcome of their id. Success
/// rows outside `bounds` are reported as failed.
pub fn reconcile(
    table: &ListingTable,
    outcomes: &[GeocodeOutcome],
    bounds: &BoundingBox,
) -> (FinalTable, ReconcileStats) {
    let mut by_id: HashMap<&str, GeocodeOutcome> = HashMap::with_capacity(outcomes.len());
    for outcome in outcomes {
        by_id
            .entry(outcome.listing_id.as_str())
            .or_insert_with(|| outcome.within(bounds));
    }

    let geocoded_columns = &CHECKPOINT_HEADERS[1..];
    let passthrough: Vec<usize> = table
        .headers
        .iter()
        .enumerate()
        .filter(|(_, name)| !geocoded_columns.contains(&name.trim().to_ascii_lowercase().as_str()))
        .map(|(idx, _)| idx)
        .collect();

    let mut headers: StringRecord = passthrough.iter().map(|&idx| &table.headers[idx]).collect();
    for column in geocoded_columns {
        headers.push_field(column);
    }

    let mut stats = ReconcileStats::default();
    let mut rows = Vec::with_capacity(table.row_count());
    for source in &table.rows {
        let outcome = if source.id.is_empty() {
            None
        } else {
            by_id.get(source.id.as_str())
        };
        stats.record(outcome.map(|o| o.status));

        let mut row: StringRecord = passthrough
            .iter()
            .map(|&idx| source.record.get(idx).unwrap_or_default())
            .collect();
        match outcome.and_then(|o| o.coordinates()) {
            Some(point) => {
                row.push_field(&point.lat.to_string());
                row.push_field(&point.lon.to_string());
            }
            None => {
                row.push_field("");
                row.push_field("");
            }
        }
        row.push_field(outcome.map_or(NOT_PROCESSED, |o| o.status.as_str()));
        rows.push(row);
    }

    (FinalTable { headers, rows }, stats.finish())
}

/// Writes next to the destination and renames over it, so readers never see
/// a half-written table.
pub fn write_final_table(path: &Path, table: &FinalTable) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::Config(format!("output path has no file name: {}", path.display())))?;
    let staging = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut writer = csv::Writer::from_writer(File::create(&staging)?);
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|err| AppError::Io(err.into_error()))?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, path)?;
    Ok(())
}

/// `geocoded_<input name>` in the checkpoint's directory.
pub fn default_output_path(input: &Path, checkpoint: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "listings.csv".to_string());
    let dir = checkpoint.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("geocoded_{name}"))
}

/// Reloads the checkpoint and rewrites the final table. Safe to repeat.
pub fn reconcile_files(
    table: &ListingTable,
    checkpoint: &Path,
    output: &Path,
    bounds: &BoundingBox,
) -> AppResult<ReconcileStats> {
    let outcomes = load_outcomes(checkpoint)?;
    let (final_table, stats) = reconcile(table, &outcomes, bounds);
    write_final_table(output, &final_table)?;

    info!(
        output = %output.display(),
        total = stats.total,
        success = stats.success,
        failed = stats.failed,
        not_processed = stats.not_processed,
        success_rate = %stats.success_rate.map(|r| format!("{:.1}%", r * 100.0)).unwrap_or_default(),
        "final table written"
    );
    if stats.not_processed > 0 {
        warn!(
            not_processed = stats.not_processed,
            "some listings have not been attempted yet; rerun to resume"
        );
    }
    Ok(stats)
}
