//! Caches in front of a storage
//!
//! - [`CachedHistoryStorage`]: least recently used read cache
//! - [`HistoryStorageCache`]: buffers chunks and stores them in batches

use super::{
    DisposeAction, HistoryObserver, HistoryStorage, ObservableHistoryStorage, WritableHistoryStorage,
};
use crate::bucket::{HistoryBucket, HistoryUpdateInfo};
use crate::chunk::HistoryChunk;
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::Result;
use crate::range::SamplingPeriod;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Counters of a [`CachedHistoryStorage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Cached lookups, `None` remembers that nothing is stored
struct CacheState {
    /// `None` if the capacity is zero
    entries: Option<LruCache<HistoryBucketDescriptor, Option<HistoryBucket>>>,
    /// Incremented by every invalidation
    generation: u64,
    stats: CacheStats,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            generation: 0,
            stats: CacheStats::default(),
        }
    }

    fn get(&mut self, descriptor: &HistoryBucketDescriptor) -> Option<Option<HistoryBucket>> {
        let cached = self
            .entries
            .as_mut()
            .and_then(|entries| entries.get(descriptor).cloned());
        if cached.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        cached
    }

    fn insert(&mut self, descriptor: HistoryBucketDescriptor, bucket: Option<HistoryBucket>) {
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        if let Some((evicted, _)) = entries.push(descriptor, bucket) {
            if evicted != descriptor {
                self.stats.evictions += 1;
            }
        }
    }

    fn invalidate(&mut self, descriptor: &HistoryBucketDescriptor) {
        self.generation += 1;
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(descriptor);
        }
    }

    fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }
}

/// Read cache in front of another storage.
///
/// Writes go through to the inner storage. Every change the inner storage
/// reports to its observers invalidates the cached entry.
pub struct CachedHistoryStorage<S> {
    inner: Arc<S>,
    cache: Arc<Mutex<CacheState>>,
}

impl<S> CachedHistoryStorage<S>
where
    S: HistoryStorage + ObservableHistoryStorage,
{
    /// Creates the cache holding at most `capacity` entries. A capacity of zero disables caching.
    pub fn new(inner: Arc<S>, capacity: usize) -> Self {
        let cache = Arc::new(Mutex::new(CacheState::new(capacity)));

        let invalidated = Arc::clone(&cache);
        inner.observe(Arc::new(
            move |descriptor: &HistoryBucketDescriptor, _: &HistoryUpdateInfo| {
                invalidated.lock().invalidate(descriptor)
            },
        ));

        Self { inner, cache }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats
    }

    /// Number of cached entries, including cached misses
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }
}

impl<S> HistoryStorage for CachedHistoryStorage<S>
where
    S: HistoryStorage + ObservableHistoryStorage,
{
    fn get(&self, descriptor: &HistoryBucketDescriptor) -> Result<Option<HistoryBucket>> {
        let generation = {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(descriptor) {
                return Ok(cached);
            }
            cache.generation
        };

        // Loaded without the lock. If anything has been invalidated meanwhile,
        // the loaded bucket may be outdated and is not cached.
        let bucket = self.inner.get(descriptor)?;
        let mut cache = self.cache.lock();
        if cache.generation == generation {
            cache.insert(*descriptor, bucket.clone());
        } else {
            debug!("Not caching {} - updated while loading", descriptor);
        }
        Ok(bucket)
    }
}

impl<S> WritableHistoryStorage for CachedHistoryStorage<S>
where
    S: WritableHistoryStorage + ObservableHistoryStorage,
{
    /// The next read loads the stored bucket from the inner storage
    fn store_without_cache(&self, bucket: HistoryBucket, update_info: HistoryUpdateInfo) -> Result<()> {
        let descriptor = *bucket.descriptor();
        let result = self.inner.store_without_cache(bucket, update_info);
        self.cache.lock().invalidate(&descriptor);
        result
    }

    fn delete(&self, descriptor: &HistoryBucketDescriptor) -> Result<()> {
        let result = self.inner.delete(descriptor);
        self.cache.lock().invalidate(descriptor);
        result
    }
}

impl<S> ObservableHistoryStorage for CachedHistoryStorage<S>
where
    S: HistoryStorage + ObservableHistoryStorage,
{
    fn observe(&self, observer: HistoryObserver) {
        self.inner.observe(observer);
    }

    fn on_dispose(&self, action: DisposeAction) {
        self.inner.on_dispose(action);
    }
}

/// Buffers chunks per sampling period until [`HistoryStorageCache::flush`] is called.
///
/// Chunks stay buffered until they have been stored successfully.
pub struct HistoryStorageCache<S> {
    storage: Arc<S>,
    pending: Mutex<HashMap<SamplingPeriod, HistoryChunk>>,
}

impl<S: WritableHistoryStorage> HistoryStorageCache<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Buffers the chunk. Chunks of the same sampling period are merged.
    ///
    /// If the configuration has changed, the buffered chunk of that period is stored first.
    /// If that fails, the buffer is unchanged and the new chunk is not buffered.
    pub fn schedule_for_store(&self, chunk: HistoryChunk, sampling_period: SamplingPeriod) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut pending = self.pending.lock();
        let merged = match pending.get(&sampling_period) {
            Some(existing) if existing.configuration() == chunk.configuration() => {
                existing.merge(&chunk)?
            }
            Some(existing) => {
                debug!("Configuration changed, storing buffered {} samples", sampling_period);
                self.storage.store_chunk(existing, sampling_period)?;
                chunk
            }
            None => chunk,
        };
        pending.insert(sampling_period, merged);
        Ok(())
    }

    /// Number of buffered samples (all sampling periods)
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .values()
            .map(HistoryChunk::timestamps_count)
            .sum()
    }

    /// Stores all buffered chunks. Returns the number of stored buckets.
    ///
    /// A chunk that fails to store stays buffered, as do all chunks not stored yet.
    pub fn flush(&self) -> Result<usize> {
        let mut pending = self.pending.lock();
        let sampling_periods: Vec<SamplingPeriod> = pending.keys().copied().collect();

        let mut stored = 0;
        for sampling_period in sampling_periods {
            if let Some(chunk) = pending.get(&sampling_period) {
                stored += self.storage.store_chunk(chunk, sampling_period)?.len();
                pending.remove(&sampling_period);
            }
        }
        if stored > 0 {
            debug!("Flushed {} buckets", stored);
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{DecimalDataSeriesIndex, HistoryChunkBuilder};
    use crate::range::{HistoryBucketRange, Millis};
    use crate::schema::HistoryConfiguration;
    use crate::error::HistoryError;
    use crate::storage::memory::InMemoryHistoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stores another bucket while a lookup is in flight
    struct WriteDuringGet {
        inner: InMemoryHistoryStorage,
        write_on_get: Mutex<Option<HistoryBucket>>,
    }

    impl HistoryStorage for WriteDuringGet {
        fn get(&self, descriptor: &HistoryBucketDescriptor) -> Result<Option<HistoryBucket>> {
            let loaded = self.inner.get(descriptor)?;
            if let Some(newer) = self.write_on_get.lock().take() {
                let info = HistoryUpdateInfo::from_descriptor(newer.descriptor());
                self.inner.store_without_cache(newer, info)?;
            }
            Ok(loaded)
        }
    }

    impl ObservableHistoryStorage for WriteDuringGet {
        fn observe(&self, observer: HistoryObserver) {
            self.inner.observe(observer);
        }

        fn on_dispose(&self, action: DisposeAction) {
            self.inner.on_dispose(action);
        }
    }

    /// Fails the first `failures` stores
    struct FailingStorage {
        inner: InMemoryHistoryStorage,
        failures: AtomicUsize,
    }

    impl FailingStorage {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryHistoryStorage::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl HistoryStorage for FailingStorage {
        fn get(&self, descriptor: &HistoryBucketDescriptor) -> Result<Option<HistoryBucket>> {
            self.inner.get(descriptor)
        }
    }

    impl WritableHistoryStorage for FailingStorage {
        fn store_without_cache(&self, bucket: HistoryBucket, update_info: HistoryUpdateInfo) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(HistoryError::io(
                    "bucket.json",
                    std::io::Error::other("disk full"),
                ));
            }
            self.inner.store_without_cache(bucket, update_info)
        }

        fn delete(&self, descriptor: &HistoryBucketDescriptor) -> Result<()> {
            self.inner.delete(descriptor)
        }
    }

    fn chunk(timestamps: &[Millis]) -> HistoryChunk {
        let configuration = HistoryConfiguration::only_decimals(&[17, 18], &["a", "b"]).unwrap();
        let mut builder = HistoryChunkBuilder::new(configuration);
        for timestamp in timestamps {
            builder.add_decimal_values(*timestamp, &[*timestamp, *timestamp + 1_000.0]);
        }
        builder.build().unwrap()
    }

    fn bucket(index: i64) -> HistoryBucket {
        let descriptor = HistoryBucketDescriptor::for_index(index, HistoryBucketRange::HundredMillis);
        HistoryBucket::new(descriptor, chunk(&[descriptor.start()])).unwrap()
    }

    #[test]
    fn test_caches_hits_and_misses() {
        let inner = Arc::new(InMemoryHistoryStorage::new());
        let cached = CachedHistoryStorage::new(Arc::clone(&inner), 10);
        let stored = bucket(0);
        inner
            .store_without_cache(stored.clone(), HistoryUpdateInfo::from_descriptor(stored.descriptor()))
            .unwrap();

        assert_eq!(cached.get(stored.descriptor()).unwrap(), Some(stored.clone()));
        assert_eq!(cached.get(stored.descriptor()).unwrap(), Some(stored.clone()));

        let missing = HistoryBucketDescriptor::for_index(1, HistoryBucketRange::HundredMillis);
        assert_eq!(cached.get(&missing).unwrap(), None);
        assert_eq!(cached.get(&missing).unwrap(), None);

        assert_eq!(
            cached.cache_stats(),
            CacheStats {
                hits: 2,
                misses: 2,
                evictions: 0
            }
        );
    }

    #[test]
    fn test_invalidated_by_inner_updates() {
        let inner = Arc::new(InMemoryHistoryStorage::new());
        let cached = CachedHistoryStorage::new(Arc::clone(&inner), 10);
        let descriptor = HistoryBucketDescriptor::for_index(0, HistoryBucketRange::HundredMillis);

        // Cached miss
        assert_eq!(cached.get(&descriptor).unwrap(), None);

        let stored = bucket(0);
        inner
            .store_without_cache(stored.clone(), HistoryUpdateInfo::from_descriptor(&descriptor))
            .unwrap();
        assert_eq!(cached.get(&descriptor).unwrap(), Some(stored));

        inner.delete(&descriptor).unwrap();
        assert_eq!(cached.get(&descriptor).unwrap(), None);
    }

    #[test]
    fn test_write_through() {
        let inner = Arc::new(InMemoryHistoryStorage::new());
        let cached = CachedHistoryStorage::new(Arc::clone(&inner), 10);
        let stored = bucket(4);

        cached
            .store_without_cache(stored.clone(), HistoryUpdateInfo::from_descriptor(stored.descriptor()))
            .unwrap();
        assert_eq!(inner.get(stored.descriptor()).unwrap(), Some(stored.clone()));
        assert_eq!(cached.get(stored.descriptor()).unwrap(), Some(stored.clone()));
        assert_eq!(cached.get(stored.descriptor()).unwrap(), Some(stored.clone()));
        assert_eq!(cached.cache_stats().misses, 1);
        assert_eq!(cached.cache_stats().hits, 1);

        cached.delete(stored.descriptor()).unwrap();
        assert_eq!(inner.get(stored.descriptor()).unwrap(), None);
        assert_eq!(cached.get(stored.descriptor()).unwrap(), None);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let inner = Arc::new(InMemoryHistoryStorage::new());
        let cached = CachedHistoryStorage::new(Arc::clone(&inner), 2);
        let descriptors: Vec<_> = (0..3)
            .map(|index| HistoryBucketDescriptor::for_index(index, HistoryBucketRange::HundredMillis))
            .collect();

        cached.get(&descriptors[0]).unwrap();
        cached.get(&descriptors[1]).unwrap();
        // Keeps 0 alive
        cached.get(&descriptors[0]).unwrap();
        cached.get(&descriptors[2]).unwrap();

        assert_eq!(cached.cached_count(), 2);
        assert_eq!(cached.cache_stats().evictions, 1);

        cached.get(&descriptors[0]).unwrap();
        assert_eq!(cached.cache_stats().hits, 2);
        cached.get(&descriptors[1]).unwrap();
        assert_eq!(cached.cache_stats().misses, 4);
    }

    #[test]
    fn test_write_buffer() {
        let storage = Arc::new(InMemoryHistoryStorage::new());
        let cache = HistoryStorageCache::new(Arc::clone(&storage));

        cache
            .schedule_for_store(chunk(&[700.0, 701.0]), SamplingPeriod::EveryHundredMillis)
            .unwrap();
        cache
            .schedule_for_store(chunk(&[702.0, 703.0, 704.0]), SamplingPeriod::EveryHundredMillis)
            .unwrap();
        assert_eq!(cache.pending_count(), 5);

        let descriptor = HistoryBucketDescriptor::for_timestamp(700.0, HistoryBucketRange::OneMinute);
        assert_eq!(storage.get(&descriptor).unwrap(), None);

        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(cache.pending_count(), 0);

        let bucket = storage.get(&descriptor).unwrap().unwrap();
        assert_eq!(bucket.chunk().timestamps_count(), 5);
        assert_eq!(
            bucket.chunk().decimal_values_of(DecimalDataSeriesIndex(1)),
            vec![Some(1_700.0), Some(1_701.0), Some(1_702.0), Some(1_703.0), Some(1_704.0)]
        );
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn test_bucket_updated_while_loading_is_not_cached() {
        let descriptor = HistoryBucketDescriptor::for_index(0, HistoryBucketRange::HundredMillis);
        let old = bucket(0);
        let newer = HistoryBucket::new(descriptor, chunk(&[descriptor.start() + 1.0])).unwrap();

        let inner = Arc::new(WriteDuringGet {
            inner: InMemoryHistoryStorage::new(),
            write_on_get: Mutex::new(Some(newer.clone())),
        });
        inner
            .inner
            .store_without_cache(old.clone(), HistoryUpdateInfo::from_descriptor(&descriptor))
            .unwrap();
        let cached = CachedHistoryStorage::new(Arc::clone(&inner), 10);

        // Loaded before the write happened
        assert_eq!(cached.get(&descriptor).unwrap(), Some(old));
        assert_eq!(cached.cached_count(), 0);

        assert_eq!(cached.get(&descriptor).unwrap(), Some(newer.clone()));
        assert_eq!(cached.get(&descriptor).unwrap(), Some(newer));
        assert_eq!(cached.cache_stats().hits, 1);
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let inner = Arc::new(InMemoryHistoryStorage::new());
        let cached = CachedHistoryStorage::new(Arc::clone(&inner), 0);
        let descriptor = HistoryBucketDescriptor::for_index(0, HistoryBucketRange::HundredMillis);

        assert_eq!(cached.get(&descriptor).unwrap(), None);
        assert_eq!(cached.get(&descriptor).unwrap(), None);
        assert_eq!(cached.cached_count(), 0);
        assert_eq!(cached.cache_stats().misses, 2);
    }

    #[test]
    fn test_failed_flush_keeps_buffered_samples() {
        let storage = Arc::new(FailingStorage::new(1));
        let cache = HistoryStorageCache::new(Arc::clone(&storage));
        cache
            .schedule_for_store(chunk(&[700.0, 701.0]), SamplingPeriod::EveryHundredMillis)
            .unwrap();

        assert!(cache.flush().is_err());
        assert_eq!(cache.pending_count(), 2);

        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(cache.pending_count(), 0);
        let descriptor = HistoryBucketDescriptor::for_timestamp(700.0, HistoryBucketRange::OneMinute);
        assert_eq!(
            storage.get(&descriptor).unwrap().unwrap().chunk().timestamps_count(),
            2
        );
    }

    #[test]
    fn test_failed_store_on_configuration_change_keeps_buffer() {
        let storage = Arc::new(FailingStorage::new(1));
        let cache = HistoryStorageCache::new(Arc::clone(&storage));
        cache
            .schedule_for_store(chunk(&[700.0, 701.0]), SamplingPeriod::EveryHundredMillis)
            .unwrap();

        let configuration = HistoryConfiguration::only_decimals(&[99], &["other"]).unwrap();
        let mut builder = HistoryChunkBuilder::new(configuration);
        builder.add_decimal_values(702.0, &[1.0]);
        let other = builder.build().unwrap();

        assert!(cache
            .schedule_for_store(other.clone(), SamplingPeriod::EveryHundredMillis)
            .is_err());
        assert_eq!(cache.pending_count(), 2);

        // The retry stores the old samples and buffers the new ones
        cache
            .schedule_for_store(other, SamplingPeriod::EveryHundredMillis)
            .unwrap();
        assert_eq!(cache.pending_count(), 1);
        let descriptor = HistoryBucketDescriptor::for_timestamp(700.0, HistoryBucketRange::OneMinute);
        assert_eq!(
            storage.get(&descriptor).unwrap().unwrap().chunk().timestamps_count(),
            2
        );
    }
}
