use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use std::io;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use crate::errors::{AppError, AppResult};
use crate::geo::{BoundingBox, Coordinates};

pub const CHECKPOINT_HEADERS: [&str; 4] = ["id", "geocoded_lat", "geocoded_lon", "geocoded_status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeStatus {
    Success,
    Failed,
}

impl GeocodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeStatus::Success => "success",
            GeocodeStatus::Failed => "failed",
        }
    }
}

/// One row of the checkpoint store.
///
/// Built only through [`GeocodeOutcome::success`] and [`GeocodeOutcome::failed`],
/// which keep `status == Success` equivalent to "both coordinates present and
/// inside the bounding box".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeOutcome {
    #[serde(rename = "id")]
    pub listing_id: String,
    #[serde(rename = "geocoded_lat")]
    pub latitude: Option<f64>,
    #[serde(rename = "geocoded_lon")]
    pub longitude: Option<f64>,
    #[serde(rename = "geocoded_status")]
    pub status: GeocodeStatus,
}

impl GeocodeOutcome {
    pub fn success(listing_id: impl Into<String>, point: Coordinates, bounds: &BoundingBox) -> Self {
        let listing_id = listing_id.into();
        if !bounds.contains(&point) {
            warn!(%listing_id, ?point, "resolved point outside bounding box; recording failure");
            return Self::failed(listing_id);
        }
        Self {
            listing_id,
            latitude: Some(point.lat),
            longitude: Some(point.lon),
            status: GeocodeStatus::Success,
        }
    }

    pub fn failed(listing_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            latitude: None,
            longitude: None,
            status: GeocodeStatus::Failed,
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.status, self.latitude, self.longitude) {
            (GeocodeStatus::Success, Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        }
    }

    /// Re-applies the bounding-box check to a row read back from disk, which
    /// may predate the current bounds.
    pub fn within(&self, bounds: &BoundingBox) -> GeocodeOutcome {
        match self.coordinates() {
            Some(point) => GeocodeOutcome::success(&self.listing_id, point, bounds),
            None => self.clone(),
        }
    }

    /// Rows read back from disk are trusted only if they still satisfy the
    /// status/coordinate invariant.
    fn is_consistent(&self) -> bool {
        match self.status {
            GeocodeStatus::Success => self.latitude.is_some() && self.longitude.is_some(),
            GeocodeStatus::Failed => self.latitude.is_none() && self.longitude.is_none(),
        }
    }
}

/// Append-only CSV of outcomes keyed by listing id.
///
/// All appends go through one lock, and ids already present (from this run or
/// an earlier one) are dropped before writing, so a file never holds two rows
/// for the same id.
pub struct CheckpointStore {
    path: PathBuf,
    known_ids: Mutex<HashSet<String>>,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl CheckpointStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if read_if_exists(&path)?.is_some_and(|contents| is_torn_header(&contents)) {
            warn!(path = %path.display(), "checkpoint holds only a partial header; starting it over");
            File::create(&path)?;
        }
        let known_ids = load_outcomes(&path)?
            .into_iter()
            .map(|outcome| outcome.listing_id)
            .collect::<HashSet<_>>();
        if !known_ids.is_empty() {
            info!(
                path = %path.display(),
                attempted = known_ids.len(),
                "loaded checkpoint"
            );
        }
        Ok(Self {
            path,
            known_ids: Mutex::new(known_ids),
            #[cfg(test)]
            fault_injector: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn attempted_ids(&self) -> HashSet<String> {
        self.known_ids.lock().clone()
    }

    pub fn contains(&self, listing_id: &str) -> bool {
        self.known_ids.lock().contains(listing_id)
    }

    pub fn len(&self) -> usize {
        self.known_ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the not-yet-recorded outcomes of `batch` in one append and
    /// returns how many rows were written. On error nothing is marked as
    /// recorded, so the caller may retry the same batch.
    pub fn append(&self, batch: &[GeocodeOutcome]) -> AppResult<usize> {
        let mut known = self.known_ids.lock();
        let mut batch_ids = HashSet::new();
        let fresh: Vec<&GeocodeOutcome> = batch
            .iter()
            .filter(|outcome| !known.contains(&outcome.listing_id))
            .filter(|outcome| batch_ids.insert(outcome.listing_id.as_str()))
            .collect();
        if fresh.is_empty() {
            debug!(batch = batch.len(), "every outcome in batch already recorded");
            return Ok(0);
        }

        let needs_header = fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let encoded = encode_batch(&fresh, needs_header)?;
        self.write_batch(&encoded)?;

        for outcome in &fresh {
            known.insert(outcome.listing_id.clone());
        }
        Ok(fresh.len())
    }

    pub fn load_all(&self) -> AppResult<Vec<GeocodeOutcome>> {
        let _guard = self.known_ids.lock();
        load_outcomes(&self.path)
    }

    fn write_batch(&self, encoded: &[u8]) -> AppResult<()> {
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_disk_full())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let mut buffer = Vec::with_capacity(encoded.len() + 1);
        if ends_with_torn_line(&mut file)? {
            warn!(path = %self.path.display(), "repairing truncated checkpoint tail");
            buffer.push(b'\n');
        }
        buffer.extend_from_slice(encoded);
        file.write_all(&buffer)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

/// Reads every well-formed row, keeping the first row per id. Rows damaged by
/// a kill mid-write are skipped so their ids get attempted again.
pub fn load_outcomes(path: &Path) -> AppResult<Vec<GeocodeOutcome>> {
    let contents = match read_if_exists(path)? {
        Some(contents) if !is_torn_header(&contents) => contents,
        _ => return Ok(Vec::new()),
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents.as_slice());

    let headers = reader.headers()?.clone();
    if !headers.is_empty() && headers.iter().ne(CHECKPOINT_HEADERS.iter().copied()) {
        return Err(AppError::Checkpoint(format!(
            "{} has unexpected columns: {:?}",
            path.display(),
            headers
        )));
    }

    let mut seen = HashSet::new();
    let mut outcomes = Vec::new();
    for (row, record) in reader.deserialize::<GeocodeOutcome>().enumerate() {
        match record {
            Ok(outcome) if outcome.is_consistent() => {
                if seen.insert(outcome.listing_id.clone()) {
                    outcomes.push(outcome);
                } else {
                    debug!(listing_id = %outcome.listing_id, "ignoring duplicate checkpoint row");
                }
            }
            Ok(outcome) => {
                warn!(listing_id = %outcome.listing_id, row = row + 2, "skipping inconsistent checkpoint row");
            }
            Err(err) => {
                warn!(row = row + 2, error = %err, "skipping unreadable checkpoint row");
            }
        }
    }
    Ok(outcomes)
}

fn read_if_exists(path: &Path) -> AppResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AppError::Io(err)),
    }
}

/// A kill during the very first append can leave nothing but a prefix of the
/// header line.
fn is_torn_header(contents: &[u8]) -> bool {
    let header = CHECKPOINT_HEADERS.join(",");
    !contents.is_empty() && !contents.contains(&b'\n') && header.as_bytes().starts_with(contents)
}

fn encode_batch(batch: &[&GeocodeOutcome], with_header: bool) -> AppResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(with_header)
        .from_writer(Vec::new());
    for outcome in batch {
        writer.serialize(outcome)?;
    }
    writer
        .into_inner()
        .map_err(|err| AppError::Checkpoint(format!("failed to encode batch: {err}")))
}

fn ends_with_torn_line(file: &mut File) -> AppResult<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    disk_full: AtomicBool,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_disk_full(&self) {
        self.disk_full.store(true, Ordering::SeqCst);
    }

    fn take_disk_full(&self) -> bool {
        self.disk_full.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
impl CheckpointStore {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn success(id: &str, lat: f64, lon: f64) -> GeocodeOutcome {
        GeocodeOutcome::success(id, Coordinates::new(lat, lon), &BoundingBox::default())
    }

    #[test]
    fn writes_header_once_and_appends_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.append(&[success("A1", 30.27, -97.74)]).unwrap(), 1);
        assert_eq!(store.append(&[GeocodeOutcome::failed("B2")]).unwrap(), 1);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "id,geocoded_lat,geocoded_lon,geocoded_status\n\
             A1,30.27,-97.74,success\n\
             B2,,,failed\n"
        );
    }

    #[test]
    fn suppresses_duplicates_within_and_across_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        {
            let store = CheckpointStore::open(&path).unwrap();
            let written = store
                .append(&[
                    success("A1", 30.27, -97.74),
                    GeocodeOutcome::failed("A1"),
                    GeocodeOutcome::failed("C3"),
                ])
                .unwrap();
            assert_eq!(written, 2);
        }

        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.contains("A1"));
        assert_eq!(store.append(&[GeocodeOutcome::failed("A1")]).unwrap(), 0);

        let rows = store.load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, GeocodeStatus::Success);
    }

    #[test]
    fn out_of_region_success_becomes_failure() {
        let outcome = success("Z9", 47.6, -122.3);
        assert_eq!(outcome.status, GeocodeStatus::Failed);
        assert_eq!(outcome.latitude, None);
        assert_eq!(outcome.longitude, None);
    }

    #[test]
    fn reloaded_rows_are_rechecked_against_bounds() {
        let stale = GeocodeOutcome {
            listing_id: "Z9".into(),
            latitude: Some(47.6),
            longitude: Some(-122.3),
            status: GeocodeStatus::Success,
        };
        assert_eq!(stale.within(&BoundingBox::default()), GeocodeOutcome::failed("Z9"));

        let inside = success("A1", 30.27, -97.74);
        assert_eq!(inside.within(&BoundingBox::default()), inside);
        let failed = GeocodeOutcome::failed("B2");
        assert_eq!(failed.within(&BoundingBox::default()), failed);
    }

    #[test]
    fn repairs_torn_tail_and_skips_broken_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        fs::write(
            &path,
            "id,geocoded_lat,geocoded_lon,geocoded_status\nA1,30.27,-97.74,success\nB2,30.2",
        )
        .unwrap();

        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.contains("A1"));
        assert!(!store.contains("B2"));

        store.append(&[GeocodeOutcome::failed("B2")]).unwrap();
        let rows = load_outcomes(&path).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "B2"]);
        assert_eq!(rows[1].status, GeocodeStatus::Failed);
    }

    #[test]
    fn restarts_file_cut_off_inside_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        fs::write(&path, "id,geocoded_la").unwrap();
        assert!(load_outcomes(&path).unwrap().is_empty());

        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.append(&[GeocodeOutcome::failed("A1")]).unwrap(), 1);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "id,geocoded_lat,geocoded_lon,geocoded_status\nA1,,,failed\n"
        );
        assert_eq!(load_outcomes(&path).unwrap(), vec![GeocodeOutcome::failed("A1")]);
    }

    #[test]
    fn rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        fs::write(&path, "name,value\nx,1\n").unwrap();
        assert!(matches!(
            CheckpointStore::open(&path),
            Err(AppError::Checkpoint(_))
        ));
    }

    #[test]
    fn failed_write_leaves_ids_unrecorded() {
        let dir = tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path().join("progress.csv")).unwrap();
        let hooks = store.enable_test_hooks();
        hooks.fail_next_disk_full();

        assert!(store.append(&[GeocodeOutcome::failed("A1")]).is_err());
        assert!(!store.contains("A1"));
        assert_eq!(store.append(&[GeocodeOutcome::failed("A1")]).unwrap(), 1);
    }
}
