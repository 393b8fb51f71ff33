use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use frame_link::{StatusSnapshot, WorkerState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::reporter::StatusReporter;
use super::sampler::{BucketSampler, throttle_delay};
use crate::config::{Configuration, ThrottleOptions};
use crate::error::PhotoError;
use crate::pipeline::{PhotoPipeline, ProcessedPhoto};
use crate::source::{Bucket, Candidate, PhotoRef, PhotoSource, cache_file_id};
use crate::{SharedCache, SharedRejections, lock};

const LISTING_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub recency_bias: f64,
    pub sampling_seed: Option<u64>,
    pub throttle: ThrottleOptions,
    /// Pause between attempts to enumerate the buckets at startup.
    pub listing_retry: Duration,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Configuration) -> Self {
        Self {
            recency_bias: cfg.recency_bias,
            sampling_seed: cfg.sampling_seed,
            throttle: cfg.throttle.clone(),
            listing_retry: LISTING_RETRY,
        }
    }
}

#[derive(Debug)]
enum SkipReason {
    Cached,
    Rejected,
}

#[derive(Debug)]
enum AttemptOutcome {
    Cached(ProcessedPhoto),
    Skipped(SkipReason),
    Failed { file_id: String, error: PhotoError },
    Interrupted,
}

#[derive(Debug, Default)]
struct Progress {
    total: u64,
    processed: u64,
    failed: u64,
}

impl Progress {
    fn snapshot(&self, status: WorkerState) -> StatusSnapshot {
        StatusSnapshot {
            status,
            num_total_photos: self.total,
            num_processed_photos: self.processed,
            num_failed_photos: self.failed,
        }
    }
}

/// Lazily listed bucket contents plus how many of them are still unattempted.
struct BucketState {
    photos: Vec<PhotoRef>,
    unattempted: usize,
}

/// Walks the source once, caching every usable photo it draws.
///
/// One photo is processed at a time. The loop ends when every photo has been
/// attempted or when `cancel` fires.
pub struct AcquisitionWorker {
    source: Arc<dyn PhotoSource>,
    pipeline: Arc<PhotoPipeline>,
    cache: SharedCache,
    rejections: SharedRejections,
    reporter: StatusReporter,
    settings: WorkerSettings,
}

async fn blocking<T, F>(work: F) -> Result<T, PhotoError>
where
    F: FnOnce() -> Result<T, PhotoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(PhotoError::transient)?
}

impl AcquisitionWorker {
    pub fn new(
        source: Arc<dyn PhotoSource>,
        pipeline: Arc<PhotoPipeline>,
        cache: SharedCache,
        rejections: SharedRejections,
        reporter: StatusReporter,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source,
            pipeline,
            cache,
            rejections,
            reporter,
            settings,
        }
    }

    /// Returns the last snapshot reported.
    #[instrument(name = "acquisition", skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<StatusSnapshot> {
        let mut progress = Progress::default();
        self.reporter.report(progress.snapshot(WorkerState::Starting));

        let Some(buckets) = self.enumerate_buckets(&cancel).await else {
            info!("cancelled before buckets were listed");
            return Ok(self.reporter.latest());
        };
        progress.total = buckets.iter().map(|b| b.count as u64).sum();
        info!(
            buckets = buckets.len(),
            photos = progress.total,
            "starting acquisition"
        );
        self.reporter.report(progress.snapshot(WorkerState::Working));

        let mut rng = match self.settings.sampling_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut sampler = BucketSampler::new(buckets.len(), self.settings.recency_bias);
        let mut listed: HashMap<usize, BucketState> = HashMap::new();
        let mut attempted: HashSet<PhotoRef> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                info!("acquisition cancelled");
                return Ok(self.reporter.latest());
            }
            let Some(index) = sampler.draw(&mut rng) else {
                break;
            };

            if !listed.contains_key(&index) {
                let bucket = buckets[index].clone();
                let source = self.source.clone();
                match blocking(move || source.list_photos(&bucket)).await {
                    Ok(photos) => {
                        debug!(bucket = %buckets[index].id, photos = photos.len(), "listed bucket");
                        let unattempted = photos.len();
                        listed.insert(index, BucketState { photos, unattempted });
                    }
                    Err(error) if error.is_permanent() => {
                        warn!(bucket = %buckets[index].id, %error, "dropping unlistable bucket");
                        sampler.retire(index);
                        continue;
                    }
                    Err(error) => {
                        warn!(bucket = %buckets[index].id, %error, "bucket listing failed; will retry");
                        tokio::select! {
                            _ = cancel.cancelled() => continue,
                            _ = sleep(self.settings.throttle.min_delay) => continue,
                        }
                    }
                }
            }
            let Some(state) = listed.get_mut(&index) else {
                continue;
            };
            if state.unattempted == 0 {
                sampler.retire(index);
                continue;
            }

            let photo = state.photos[rng.random_range(0..state.photos.len())].clone();
            if !attempted.insert(photo.clone()) {
                continue;
            }
            state.unattempted -= 1;
            if state.unattempted == 0 {
                sampler.retire(index);
            }

            match self.attempt(photo, &cancel, &mut rng).await {
                AttemptOutcome::Cached(done) => {
                    progress.processed += 1;
                    debug!(file_id = %done.file_id, bytes = done.size_bytes, "attempt cached");
                }
                AttemptOutcome::Skipped(reason) => {
                    debug!(?reason, "attempt skipped");
                }
                AttemptOutcome::Failed { file_id, error } => {
                    progress.failed += 1;
                    if error.is_permanent() {
                        warn!(%file_id, %error, "rejecting photo");
                        self.reject(file_id).await;
                    } else {
                        warn!(%file_id, %error, "photo failed; will retry on a later run");
                    }
                }
                AttemptOutcome::Interrupted => {
                    info!("acquisition cancelled during throttle");
                    return Ok(self.reporter.latest());
                }
            }
            self.reporter.report(progress.snapshot(WorkerState::Working));
        }

        let finished = progress.snapshot(WorkerState::Finished);
        info!(
            processed = finished.num_processed_photos,
            failed = finished.num_failed_photos,
            "acquisition finished"
        );
        self.reporter.report(finished.clone());
        Ok(finished)
    }

    async fn enumerate_buckets(&self, cancel: &CancellationToken) -> Option<Vec<Bucket>> {
        loop {
            let source = self.source.clone();
            match blocking(move || source.list_buckets()).await {
                Ok(mut buckets) => {
                    buckets.sort_by(|a, b| a.time_label.cmp(&b.time_label));
                    return Some(buckets);
                }
                Err(error) => {
                    warn!(%error, retry_in = ?self.settings.listing_retry, "failed to list buckets");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(self.settings.listing_retry) => {}
            }
        }
    }

    async fn attempt(
        &self,
        photo: PhotoRef,
        cancel: &CancellationToken,
        rng: &mut StdRng,
    ) -> AttemptOutcome {
        let file_id = cache_file_id(&photo.photo_id);
        if lock(&self.cache).contains(&file_id) {
            return AttemptOutcome::Skipped(SkipReason::Cached);
        }
        if lock(&self.rejections).contains(&file_id) {
            return AttemptOutcome::Skipped(SkipReason::Rejected);
        }

        let source = self.source.clone();
        let lookup = photo.clone();
        let metadata = match blocking(move || source.metadata(&lookup)).await {
            Ok(metadata) => metadata,
            Err(error) => return AttemptOutcome::Failed { file_id, error },
        };
        if let Err(error) = self.pipeline.check_metadata(&metadata) {
            return AttemptOutcome::Failed { file_id, error };
        }

        let cached_files = lock(&self.cache).len();
        let delay = throttle_delay(cached_files, &self.settings.throttle, rng);
        debug!(%file_id, ?delay, "throttling before download");
        tokio::select! {
            _ = cancel.cancelled() => return AttemptOutcome::Interrupted,
            _ = sleep(delay) => {}
        }

        let candidate = Candidate { photo, metadata };
        let source = self.source.clone();
        let pipeline = self.pipeline.clone();
        let cache = self.cache.clone();
        match blocking(move || pipeline.process(source.as_ref(), &candidate, &cache)).await {
            Ok(done) => AttemptOutcome::Cached(done),
            Err(error) => AttemptOutcome::Failed { file_id, error },
        }
    }

    async fn reject(&self, file_id: String) {
        let rejections = self.rejections.clone();
        let persisted = blocking(move || {
            lock(&rejections)
                .insert(&file_id)
                .map_err(PhotoError::from)
        })
        .await;
        if let Err(error) = persisted {
            warn!(%error, "failed to persist rejection");
        }
    }
}
