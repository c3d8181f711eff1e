use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, GeocodeOutcome, GeocodeStatus};
use crate::errors::AppResult;
use crate::geo::BoundingBox;
use crate::listings::Listing;
use crate::normalize::normalize;
use crate::resolver::CoordinateResolver;
use crate::retry::{Attempted, RetryPolicy};

/// Resolves a single listing end to end: screening, normalization, resolution
/// under the retry budget, and the final outcome.
pub struct ListingGeocoder {
    resolver: CoordinateResolver,
    retry: RetryPolicy,
    bounds: BoundingBox,
    required_fragment: Option<String>,
}

impl ListingGeocoder {
    pub fn new(
        resolver: CoordinateResolver,
        retry: RetryPolicy,
        bounds: BoundingBox,
        required_fragment: Option<String>,
    ) -> Self {
        Self {
            resolver,
            retry,
            bounds,
            required_fragment: required_fragment.map(|f| f.to_lowercase()),
        }
    }

    /// `Err` only for faults outside the retry taxonomy; a listing that simply
    /// could not be located is `Ok` with a failed outcome.
    pub async fn geocode(&self, listing: &Listing) -> AppResult<GeocodeOutcome> {
        if !self.is_usable(&listing.address) {
            debug!(listing_id = %listing.id, "skipping malformed address");
            return Ok(GeocodeOutcome::failed(&listing.id));
        }

        let normalized = normalize(&listing.address);
        if normalized.is_empty() {
            debug!(listing_id = %listing.id, "address empty after normalization");
            return Ok(GeocodeOutcome::failed(&listing.id));
        }
        debug!(
            listing_id = %listing.id,
            cleaned = %normalized.cleaned_text,
            has_unit = normalized.has_unit,
            "normalized address"
        );

        let attempted = self
            .retry
            .attempt(&listing.id, |_| self.resolver.resolve(&normalized))
            .await?;
        match attempted {
            Attempted::Resolved { value, attempts } => {
                debug!(listing_id = %listing.id, attempts, "geocoded");
                Ok(GeocodeOutcome::success(&listing.id, value, &self.bounds))
            }
            Attempted::Exhausted { attempts } => {
                error!(
                    listing_id = %listing.id,
                    address = %listing.address,
                    attempts,
                    "all geocoding attempts failed; no coordinates assigned"
                );
                Ok(GeocodeOutcome::failed(&listing.id))
            }
        }
    }

    fn is_usable(&self, address: &str) -> bool {
        let trimmed = address.trim();
        if !trimmed.chars().any(char::is_alphanumeric) {
            return false;
        }
        match &self.required_fragment {
            Some(fragment) => trimmed.to_lowercase().contains(fragment.as_str()),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_input: usize,
    pub skipped: usize,
    pub pending: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub written: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

pub struct BatchOrchestrator {
    geocoder: Arc<ListingGeocoder>,
    store: Arc<CheckpointStore>,
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(
        geocoder: Arc<ListingGeocoder>,
        store: Arc<CheckpointStore>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            geocoder,
            store,
            settings,
        }
    }

    /// Geocodes every listing the checkpoint store has not seen yet.
    ///
    /// Outcomes are flushed in batches; a checkpoint write failure aborts the
    /// run. Per-listing faults are logged and counted but never recorded, so
    /// those listings come back as pending on the next run.
    pub async fn run(
        &self,
        listings: &[Listing],
        observer: Option<ProgressObserver>,
    ) -> AppResult<RunSummary> {
        let attempted = self.store.attempted_ids();
        let mut queued = HashSet::new();
        let pending: Vec<Listing> = listings
            .iter()
            .filter(|listing| !attempted.contains(&listing.id))
            .filter(|listing| queued.insert(listing.id.clone()))
            .cloned()
            .collect();

        let mut summary = RunSummary {
            total_input: listings.len(),
            skipped: listings.len() - pending.len(),
            pending: pending.len(),
            ..RunSummary::default()
        };
        info!(
            total = summary.total_input,
            skipped = summary.skipped,
            remaining = summary.pending,
            workers = self.settings.workers,
            "starting geocoding run"
        );
        if pending.is_empty() {
            info!("all listings already attempted");
            return Ok(summary);
        }

        let total = pending.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut batch: Vec<GeocodeOutcome> = Vec::with_capacity(batch_size);
        let mut results = stream::iter(pending)
            .map(|listing| {
                let geocoder = Arc::clone(&self.geocoder);
                tokio::spawn(async move {
                    let outcome = geocoder.geocode(&listing).await;
                    (listing.id, outcome)
                })
            })
            .buffer_unordered(self.settings.workers.max(1));

        while let Some(joined) = results.next().await {
            summary.completed += 1;
            match joined {
                Ok((_, Ok(outcome))) => {
                    match outcome.status {
                        GeocodeStatus::Success => summary.succeeded += 1,
                        GeocodeStatus::Failed => summary.failed += 1,
                    }
                    batch.push(outcome);
                }
                Ok((listing_id, Err(err))) => {
                    summary.errored += 1;
                    warn!(%listing_id, error = %err, "error processing listing");
                }
                Err(err) => {
                    summary.errored += 1;
                    error!(error = %err, "geocoding worker crashed");
                }
            }

            if let Some(callback) = &observer {
                callback(BatchProgress {
                    completed: summary.completed,
                    total,
                    succeeded: summary.succeeded,
                    failed: summary.failed,
                });
            }

            if batch.len() >= batch_size {
                summary.written += self.flush(&mut batch)?;
                if summary.completed < total && !self.settings.inter_batch_delay.is_zero() {
                    debug!(delay = ?self.settings.inter_batch_delay, "pausing between batches");
                    sleep(self.settings.inter_batch_delay).await;
                }
            }
        }

        summary.written += self.flush(&mut batch)?;
        info!(
            completed = summary.completed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            errored = summary.errored,
            "geocoding run finished"
        );
        Ok(summary)
    }

    fn flush(&self, batch: &mut Vec<GeocodeOutcome>) -> AppResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let written = self.store.append(batch)?;
        let succeeded = batch
            .iter()
            .filter(|outcome| outcome.status == GeocodeStatus::Success)
            .count();
        info!(
            written,
            succeeded,
            failed = batch.len() - succeeded,
            "checkpoint batch saved"
        );
        batch.clear();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::tempdir;

    use super::*;
    use crate::checkpoint::load_outcomes;
    use crate::errors::AppError;
    use crate::geo::Coordinates;
    use crate::normalize::NormalizedAddress;
    use crate::resolver::{GeocodeStrategy, UnitJitter};

    const DOWNTOWN: Coordinates = Coordinates {
        lat: 30.2672,
        lon: -97.7431,
    };

    /// Answers from the cleaned address: "nowhere" never matches, "explode"
    /// is a worker fault, anything else resolves downtown.
    #[derive(Default)]
    struct FakeStrategy {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GeocodeStrategy for FakeStrategy {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn locate(&self, address: &NormalizedAddress) -> AppResult<Option<Coordinates>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(address.cleaned_text.clone());
            if address.cleaned_text.contains("explode") {
                return Err(AppError::Config("resolver misconfigured".into()));
            }
            if address.cleaned_text.contains("nowhere") {
                return Ok(None);
            }
            Ok(Some(DOWNTOWN))
        }
    }

    fn listing(id: &str, address: &str) -> Listing {
        Listing {
            id: id.into(),
            address: address.into(),
        }
    }

    fn geocoder(strategy: Arc<FakeStrategy>, max_attempts: u32) -> Arc<ListingGeocoder> {
        let resolver = CoordinateResolver::from_strategies(
            vec![strategy as Arc<dyn GeocodeStrategy>],
            UnitJitter::new(0.0002, BoundingBox::default(), StdRng::seed_from_u64(9)),
        );
        Arc::new(ListingGeocoder::new(
            resolver,
            RetryPolicy::new(max_attempts, Duration::ZERO),
            BoundingBox::default(),
            None,
        ))
    }

    fn settings(batch_size: usize) -> BatchSettings {
        BatchSettings {
            workers: 3,
            batch_size,
            inter_batch_delay: Duration::ZERO,
        }
    }

    fn listings(count: usize) -> Vec<Listing> {
        (0..count)
            .map(|i| listing(&format!("L{i}"), &format!("{i} Congress Ave, Austin, TX 78701")))
            .collect()
    }

    #[tokio::test]
    async fn empty_address_fails_without_network() {
        let strategy = Arc::new(FakeStrategy::default());
        let geocoder = geocoder(strategy.clone(), 3);
        let outcome = geocoder.geocode(&listing("B2", "")).await.unwrap();
        assert_eq!(outcome, GeocodeOutcome::failed("B2"));
        let outcome = geocoder.geocode(&listing("B3", " , ")).await.unwrap();
        assert_eq!(outcome.status, GeocodeStatus::Failed);
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn required_fragment_screens_addresses() {
        let strategy = Arc::new(FakeStrategy::default());
        let resolver = CoordinateResolver::from_strategies(
            vec![strategy.clone() as Arc<dyn GeocodeStrategy>],
            UnitJitter::new(0.0, BoundingBox::default(), StdRng::seed_from_u64(1)),
        );
        let geocoder = ListingGeocoder::new(
            resolver,
            RetryPolicy::new(1, Duration::ZERO),
            BoundingBox::default(),
            Some("Austin, TX".into()),
        );
        let outcome = geocoder
            .geocode(&listing("D4", "1 Main St, Dallas, TX"))
            .await
            .unwrap();
        assert_eq!(outcome.status, GeocodeStatus::Failed);
        let outcome = geocoder
            .geocode(&listing("A5", "1 Main St, austin, tx"))
            .await
            .unwrap();
        assert_eq!(outcome.status, GeocodeStatus::Success);
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn normalizes_and_jitters_units() {
        let strategy = Arc::new(FakeStrategy::default());
        let geocoder = geocoder(strategy.clone(), 1);
        let a = geocoder
            .geocode(&listing("A1", "100 Main St Unit 4, Austin, TX 78701"))
            .await
            .unwrap();
        let b = geocoder
            .geocode(&listing("A2", "100 Main St Unit 5, Austin, TX 78701"))
            .await
            .unwrap();

        assert_eq!(
            *strategy.seen.lock(),
            vec![
                "100 Main St, Austin, TX 78701".to_string(),
                "100 Main St, Austin, TX 78701".to_string()
            ]
        );
        let (a, b) = (a.coordinates().unwrap(), b.coordinates().unwrap());
        assert_ne!(a, b);
        assert!(a.distance_meters(&DOWNTOWN) < 35.0);
        assert!(b.distance_meters(&DOWNTOWN) < 35.0);
    }

    #[tokio::test]
    async fn exhausted_retries_record_failure_without_coordinates() {
        let strategy = Arc::new(FakeStrategy::default());
        let geocoder = geocoder(strategy.clone(), 3);
        let outcome = geocoder
            .geocode(&listing("N1", "1 nowhere Rd"))
            .await
            .unwrap();
        assert_eq!(outcome, GeocodeOutcome::failed("N1"));
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn flushes_batches_and_reports_progress() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path().join("progress.csv")).unwrap());
        let strategy = Arc::new(FakeStrategy::default());
        let orchestrator =
            BatchOrchestrator::new(geocoder(strategy.clone(), 1), store.clone(), settings(4));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: ProgressObserver = {
            let seen = Arc::clone(&seen);
            Arc::new(move |progress: BatchProgress| seen.lock().push(progress.completed))
        };

        let summary = orchestrator.run(&listings(10), Some(observer)).await.unwrap();
        assert_eq!(summary.completed, 10);
        assert_eq!(summary.succeeded, 10);
        assert_eq!(summary.written, 10);
        assert_eq!(*seen.lock(), (1..=10).collect::<Vec<_>>());
        assert_eq!(load_outcomes(store.path()).unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_each_batch_then_pauses_before_the_next() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let store = Arc::new(CheckpointStore::open(&path).unwrap());
        let strategy = Arc::new(FakeStrategy::default());
        let settings = BatchSettings {
            workers: 1,
            batch_size: 2,
            inter_batch_delay: Duration::from_secs(10),
        };
        let orchestrator = BatchOrchestrator::new(geocoder(strategy, 1), store, settings);

        let started = tokio::time::Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: ProgressObserver = {
            let seen = Arc::clone(&seen);
            let path = path.clone();
            Arc::new(move |progress: BatchProgress| {
                let on_disk = std::fs::read_to_string(&path)
                    .map(|text| text.lines().count().saturating_sub(1))
                    .unwrap_or(0);
                seen.lock()
                    .push((progress.completed, on_disk, started.elapsed().as_secs()));
            })
        };

        let summary = orchestrator.run(&listings(5), Some(observer)).await.unwrap();
        assert_eq!(summary.written, 5);
        assert_eq!(
            *seen.lock(),
            vec![(1, 0, 0), (2, 0, 0), (3, 2, 10), (4, 2, 10), (5, 4, 20)]
        );
        // the trailing partial batch is flushed without another pause
        assert_eq!(started.elapsed().as_secs(), 20);
        assert_eq!(load_outcomes(&path).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn resumes_with_only_remaining_listings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let all = listings(12);

        {
            let store = Arc::new(CheckpointStore::open(&path).unwrap());
            let strategy = Arc::new(FakeStrategy::default());
            let orchestrator =
                BatchOrchestrator::new(geocoder(strategy.clone(), 1), store, settings(5));
            // the interrupted run only got through the first 7
            let summary = orchestrator.run(&all[..7], None).await.unwrap();
            assert_eq!(summary.written, 7);
        }

        let store = Arc::new(CheckpointStore::open(&path).unwrap());
        let strategy = Arc::new(FakeStrategy::default());
        let orchestrator =
            BatchOrchestrator::new(geocoder(strategy.clone(), 1), store, settings(5));
        let summary = orchestrator.run(&all, None).await.unwrap();

        assert_eq!(summary.skipped, 7);
        assert_eq!(summary.pending, 5);
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 5);

        let rows = load_outcomes(&path).unwrap();
        assert_eq!(rows.len(), 12);
        let ids: HashSet<_> = rows.iter().map(|r| r.listing_id.clone()).collect();
        assert_eq!(ids.len(), 12);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 13);
    }

    #[tokio::test]
    async fn worker_fault_is_counted_but_not_recorded() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path().join("progress.csv")).unwrap());
        let strategy = Arc::new(FakeStrategy::default());
        let orchestrator =
            BatchOrchestrator::new(geocoder(strategy, 2), store.clone(), settings(2));

        let input = vec![
            listing("G1", "1 Congress Ave"),
            listing("X1", "1 explode Way"),
            listing("N1", "1 nowhere Rd"),
        ];
        let summary = orchestrator.run(&input, None).await.unwrap();

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(store.contains("G1"));
        assert!(store.contains("N1"));
        assert!(!store.contains("X1"));
    }

    #[tokio::test]
    async fn nothing_to_do_when_everything_attempted() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path().join("progress.csv")).unwrap());
        store.append(&[GeocodeOutcome::failed("L0")]).unwrap();
        let strategy = Arc::new(FakeStrategy::default());
        let orchestrator =
            BatchOrchestrator::new(geocoder(strategy.clone(), 1), store, settings(5));
        let summary = orchestrator.run(&listings(1), None).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.completed, 0);
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }
}
