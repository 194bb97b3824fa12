//! Keeps the coarser bucket ranges up to date
//!
//! The [`DownSamplingDirtyRangesCollector`] observes the storage and remembers
//! which time ranges of which bucket range have to be recalculated. The
//! [`DownSamplingService`] recalculates them periodically, finest range first.
//! Storing a recalculated bucket marks the next coarser range as dirty, so the
//! changes cascade up to the greatest range.

use super::calculate_down_sampled;
use crate::bucket::HistoryUpdateInfo;
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::{HistoryError, Result};
use crate::range::HistoryBucketRange;
use crate::storage::{HistoryObserver, ObservableHistoryStorage, WritableHistoryStorage};
use crate::time_range::{TimeRange, TimeRanges};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for the descriptors recalculated for a single dirty time range
const MAX_JOB_DESCRIPTORS: usize = 10_000;

/// Collects the time ranges that require down sampling.
///
/// The ranges are keyed by the bucket range that has to be recalculated: an
/// update of a `HundredMillis` bucket marks `FiveSeconds` as dirty.
#[derive(Debug, Default)]
pub struct DownSamplingDirtyRangesCollector {
    dirty: Mutex<HashMap<HistoryBucketRange, TimeRanges>>,
}

impl DownSamplingDirtyRangesCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the time range of the given bucket range as dirty
    pub fn mark_as_dirty(&self, bucket_range: HistoryBucketRange, time_range: TimeRange) {
        self.dirty
            .lock()
            .entry(bucket_range)
            .or_default()
            .add(time_range);
    }

    pub fn mark_all_as_dirty(&self, bucket_range: HistoryBucketRange, time_ranges: &TimeRanges) {
        if time_ranges.is_empty() {
            return;
        }
        self.dirty
            .lock()
            .entry(bucket_range)
            .or_default()
            .add_all(time_ranges);
    }

    /// Records an update of the storage
    pub fn on_update(&self, descriptor: &HistoryBucketDescriptor, update_info: &HistoryUpdateInfo) {
        // The greatest range has no parent to recalculate
        if let Some(parent_range) = descriptor.bucket_range().upper() {
            self.mark_all_as_dirty(parent_range, &update_info.updated_time_ranges);
        }
    }

    /// An observer that forwards all updates to this collector
    pub fn observer(self: &Arc<Self>) -> HistoryObserver {
        let collector = Arc::clone(self);
        Arc::new(move |descriptor: &HistoryBucketDescriptor, update_info: &HistoryUpdateInfo| {
            collector.on_update(descriptor, update_info)
        })
    }

    /// Returns a copy of the dirty ranges of the bucket range
    pub fn get(&self, bucket_range: HistoryBucketRange) -> Option<TimeRanges> {
        self.dirty.lock().get(&bucket_range).cloned()
    }

    /// Removes and returns the dirty ranges of the bucket range
    pub fn remove(&self, bucket_range: HistoryBucketRange) -> Option<TimeRanges> {
        self.dirty.lock().remove(&bucket_range)
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.lock().values().all(TimeRanges::is_empty)
    }
}

/// Which part of a descriptor has to be refreshed
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshRange {
    Completely,
    /// Only the given time ranges (within the descriptor) have changed
    Partially(TimeRanges),
}

impl RefreshRange {
    fn merge(self, other: RefreshRange) -> RefreshRange {
        match (self, other) {
            (RefreshRange::Partially(mut ranges), RefreshRange::Partially(other)) => {
                ranges.add_all(&other);
                RefreshRange::Partially(ranges)
            }
            _ => RefreshRange::Completely,
        }
    }
}

/// Recalculation of one descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct DownSamplingJob {
    pub descriptor: HistoryBucketDescriptor,
    pub refresh_range: RefreshRange,
}

/// Creates one job per descriptor of `bucket_range` that overlaps the dirty ranges.
///
/// The jobs are sorted by start. Jobs for the same descriptor are merged.
pub fn create_jobs(
    dirty_ranges: &TimeRanges,
    bucket_range: HistoryBucketRange,
) -> Result<Vec<DownSamplingJob>> {
    let mut jobs: BTreeMap<HistoryBucketDescriptor, RefreshRange> = BTreeMap::new();

    for time_range in dirty_ranges {
        let descriptors = HistoryBucketDescriptor::for_range(
            time_range.start,
            time_range.end,
            bucket_range,
            false,
            MAX_JOB_DESCRIPTORS,
        )?;

        for descriptor in descriptors {
            let refresh_range = if time_range.contains_range(descriptor.start(), descriptor.end()) {
                RefreshRange::Completely
            } else {
                RefreshRange::Partially(TimeRanges::of(
                    time_range.fit_within(descriptor.start(), descriptor.end()),
                ))
            };

            let merged = match jobs.remove(&descriptor) {
                Some(existing) => existing.merge(refresh_range),
                None => refresh_range,
            };
            jobs.insert(descriptor, merged);
        }
    }

    debug!("Created {} down sampling jobs for {}", jobs.len(), bucket_range);
    Ok(jobs
        .into_iter()
        .map(|(descriptor, refresh_range)| DownSamplingJob {
            descriptor,
            refresh_range,
        })
        .collect())
}

/// Recalculates the down sampled buckets of a storage
pub struct DownSamplingService<S> {
    storage: Arc<S>,
    collector: Arc<DownSamplingDirtyRangesCollector>,
    scheduled: AtomicBool,
    /// Held while jobs are running, so two runs never write the same bucket at once
    running: Mutex<()>,
}

impl<S> DownSamplingService<S>
where
    S: WritableHistoryStorage + ObservableHistoryStorage + 'static,
{
    /// Creates the service and registers its dirty ranges collector at the storage
    pub fn new(storage: Arc<S>) -> Self {
        let collector = Arc::new(DownSamplingDirtyRangesCollector::new());
        storage.observe(collector.observer());

        Self {
            storage,
            collector,
            scheduled: AtomicBool::new(false),
            running: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn dirty_ranges_collector(&self) -> &Arc<DownSamplingDirtyRangesCollector> {
        &self.collector
    }

    /// Recalculates all buckets of `bucket_range` that overlap the time ranges.
    ///
    /// Returns the number of jobs that have been run.
    pub fn recalculate(&self, time_ranges: &TimeRanges, bucket_range: HistoryBucketRange) -> Result<usize> {
        if time_ranges.is_empty() {
            return Ok(0);
        }

        let _running = self.running.lock();
        let jobs = create_jobs(time_ranges, bucket_range)?;
        for job in &jobs {
            self.run_job(job)?;
        }
        Ok(jobs.len())
    }

    fn run_job(&self, job: &DownSamplingJob) -> Result<()> {
        debug!("Running down sampling job for {}", job.descriptor);

        let children = self.storage.get_many(&job.descriptor.children())?;
        if children.is_empty() {
            return self.storage.delete(&job.descriptor);
        }

        let bucket = calculate_down_sampled(&job.descriptor, &children)?;
        let update_info = match &job.refresh_range {
            RefreshRange::Completely => {
                HistoryUpdateInfo::from_chunk(bucket.chunk(), bucket.sampling_period())
            }
            RefreshRange::Partially(time_ranges) => {
                HistoryUpdateInfo::new(bucket.sampling_period(), time_ranges.clone())
            }
        };
        self.storage.store_without_cache(bucket, update_info)
    }

    /// Recalculates every range with dirty ranges spanning at least half a sample slot.
    ///
    /// Returns the number of jobs that have been run.
    pub fn calculate_down_sampling_if_required(&self) -> Result<usize> {
        self.run(false)
    }

    /// Recalculates all dirty ranges, regardless of their span
    pub fn flush(&self) -> Result<usize> {
        self.run(true)
    }

    fn run(&self, force: bool) -> Result<usize> {
        let mut jobs = 0;

        // Finest first: recalculated buckets mark the next range as dirty
        for bucket_range in HistoryBucketRange::all().skip(1) {
            let Some(dirty) = self.collector.get(bucket_range) else {
                continue;
            };
            if !force && dirty.span() < bucket_range.duration() / 2.0 {
                continue;
            }

            let Some(dirty) = self.collector.remove(bucket_range) else {
                continue;
            };
            match self.recalculate(&dirty, bucket_range) {
                Ok(count) => jobs += count,
                Err(error) => {
                    // Try again on the next run
                    self.collector.mark_all_as_dirty(bucket_range, &dirty);
                    return Err(error);
                }
            }
        }

        if jobs > 0 {
            debug!("Down sampling finished, {} jobs", jobs);
        }
        Ok(jobs)
    }

    /// Runs [`DownSamplingService::calculate_down_sampling_if_required`] every `delay` on the
    /// blocking thread pool until the token is cancelled.
    ///
    /// Must be called within a tokio runtime and only once.
    pub fn schedule(self: &Arc<Self>, delay: Duration, token: CancellationToken) -> Result<JoinHandle<()>> {
        let handle = scheduling_handle(delay)?;
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return Err(HistoryError::AlreadyScheduled);
        }

        info!("Scheduling down sampling every {:?}", delay);
        let service = Arc::clone(self);
        Ok(handle.spawn(async move {
            let mut interval_timer = tokio::time::interval(delay);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Down sampling stopped");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        let service = Arc::clone(&service);
                        let result = tokio::task::spawn_blocking(move || {
                            service.calculate_down_sampling_if_required()
                        })
                        .await;

                        match result {
                            Ok(Ok(_)) => {}
                            Ok(Err(error)) => warn!("Down sampling failed: {}", error),
                            Err(error) => warn!("Down sampling task failed: {}", error),
                        }
                    }
                }
            }
        }))
    }
}

/// The runtime the down sampling task is spawned on
pub(crate) fn scheduling_handle(delay: Duration) -> Result<Handle> {
    if delay.is_zero() {
        return Err(HistoryError::InvalidConfig(
            "down sampling delay must be greater than zero".to_string(),
        ));
    }
    Handle::try_current().map_err(|error| {
        HistoryError::InvalidConfig(format!("down sampling requires a tokio runtime: {error}"))
    })
}
