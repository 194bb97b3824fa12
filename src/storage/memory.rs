//! In-memory history storage

use super::{
    DisposeAction, DisposeSupport, HistoryObserver, HistoryStorage, ObservableHistoryStorage,
    ObserverList, WritableHistoryStorage,
};
use crate::bucket::{HistoryBucket, HistoryUpdateInfo};
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::Result;
use crate::range::{HistoryBucketRange, Millis};
use crate::time_range::TimeRange;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// Keeps all buckets in a map. Nothing is persisted.
///
/// The map is ordered by range and start, so the earliest and latest bucket
/// of every range can be looked up directly.
#[derive(Default)]
pub struct InMemoryHistoryStorage {
    buckets: RwLock<BTreeMap<HistoryBucketDescriptor, HistoryBucket>>,
    observers: ObserverList,
    dispose_support: DisposeSupport,
}

impl InMemoryHistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored buckets (all ranges)
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Descriptors of all stored buckets of the range, sorted by start
    pub fn descriptors(&self, range: HistoryBucketRange) -> Vec<HistoryBucketDescriptor> {
        self.buckets
            .read()
            .range(bounds(range))
            .map(|(descriptor, _)| *descriptor)
            .collect()
    }

    /// The stored bucket of the range with the lowest start
    pub fn earliest_bound(&self, range: HistoryBucketRange) -> Option<HistoryBucketDescriptor> {
        self.buckets
            .read()
            .range(bounds(range))
            .next()
            .map(|(descriptor, _)| *descriptor)
    }

    /// The stored bucket of the range with the highest start
    pub fn latest_bound(&self, range: HistoryBucketRange) -> Option<HistoryBucketDescriptor> {
        self.buckets
            .read()
            .range(bounds(range))
            .next_back()
            .map(|(descriptor, _)| *descriptor)
    }

    /// From the start of the earliest to the end of the latest bucket of the range
    pub fn time_range(&self, range: HistoryBucketRange) -> Option<TimeRange> {
        let earliest = self.earliest_bound(range)?;
        let latest = self.latest_bound(range)?;
        Some(TimeRange::new(earliest.start(), latest.end()))
    }

    /// The first stored timestamp of the range
    pub fn first_timestamp(&self, range: HistoryBucketRange) -> Option<Millis> {
        self.buckets
            .read()
            .range(bounds(range))
            .find_map(|(_, bucket)| bucket.chunk().first_timestamp())
    }

    /// The last stored timestamp of the range
    pub fn last_timestamp(&self, range: HistoryBucketRange) -> Option<Millis> {
        self.buckets
            .read()
            .range(bounds(range))
            .rev()
            .find_map(|(_, bucket)| bucket.chunk().last_timestamp())
    }

    /// Removes all buckets and notifies the observers about every removed bucket
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.buckets.write());
        debug!("Cleared {} buckets", removed.len());

        for descriptor in removed.keys() {
            self.observers
                .notify(descriptor, &HistoryUpdateInfo::from_descriptor(descriptor));
        }
    }

    /// Deletes the bucket and all earlier buckets of the same range.
    ///
    /// Returns the descriptors of the deleted buckets, latest first.
    pub fn delete_and_before(&self, descriptor: &HistoryBucketDescriptor) -> Vec<HistoryBucketDescriptor> {
        let first = HistoryBucketDescriptor::for_index(i64::MIN, descriptor.bucket_range());
        let to_delete: Vec<HistoryBucketDescriptor> = self
            .buckets
            .read()
            .range(first..=*descriptor)
            .rev()
            .map(|(descriptor, _)| *descriptor)
            .collect();

        for descriptor in &to_delete {
            self.remove(descriptor);
        }
        to_delete
    }

    fn remove(&self, descriptor: &HistoryBucketDescriptor) {
        let removed = self.buckets.write().remove(descriptor);
        if removed.is_some() {
            self.observers
                .notify(descriptor, &HistoryUpdateInfo::from_descriptor(descriptor));
        }
    }

    /// Runs the dispose actions
    pub fn dispose(&self) {
        self.dispose_support.dispose();
    }
}

fn bounds(range: HistoryBucketRange) -> std::ops::RangeInclusive<HistoryBucketDescriptor> {
    HistoryBucketDescriptor::for_index(i64::MIN, range)..=HistoryBucketDescriptor::for_index(i64::MAX, range)
}

impl HistoryStorage for InMemoryHistoryStorage {
    fn get(&self, descriptor: &HistoryBucketDescriptor) -> Result<Option<HistoryBucket>> {
        Ok(self.buckets.read().get(descriptor).cloned())
    }
}

impl WritableHistoryStorage for InMemoryHistoryStorage {
    fn store_without_cache(&self, bucket: HistoryBucket, update_info: HistoryUpdateInfo) -> Result<()> {
        let descriptor = *bucket.descriptor();
        self.buckets.write().insert(descriptor, bucket);
        self.observers.notify(&descriptor, &update_info);
        Ok(())
    }

    /// Observers are only notified if a bucket has been removed
    fn delete(&self, descriptor: &HistoryBucketDescriptor) -> Result<()> {
        self.remove(descriptor);
        Ok(())
    }
}

impl ObservableHistoryStorage for InMemoryHistoryStorage {
    fn observe(&self, observer: HistoryObserver) {
        self.observers.add(observer);
    }

    fn on_dispose(&self, action: DisposeAction) {
        self.dispose_support.on_dispose(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HistoryChunkBuilder;
    use crate::schema::HistoryConfiguration;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn bucket(range: HistoryBucketRange, index: i64) -> HistoryBucket {
        let descriptor = HistoryBucketDescriptor::for_index(index, range);
        let configuration = HistoryConfiguration::only_decimals(&[1], &["a"]).unwrap();
        let mut builder = HistoryChunkBuilder::new(configuration);
        builder.add_decimal_values(descriptor.start(), &[1.0]);
        builder.add_decimal_values(descriptor.start() + range.duration(), &[2.0]);
        HistoryBucket::new(descriptor, builder.build().unwrap()).unwrap()
    }

    fn store(storage: &InMemoryHistoryStorage, bucket: HistoryBucket) {
        let info = HistoryUpdateInfo::from_descriptor(bucket.descriptor());
        storage.store_without_cache(bucket, info).unwrap();
    }

    #[test]
    fn test_store_get_delete() {
        let storage = InMemoryHistoryStorage::new();
        let bucket = bucket(HistoryBucketRange::OneMinute, 3);
        store(&storage, bucket.clone());

        assert_eq!(storage.get(bucket.descriptor()).unwrap(), Some(bucket.clone()));
        assert_eq!(storage.bucket_count(), 1);

        storage.delete(bucket.descriptor()).unwrap();
        storage.delete(bucket.descriptor()).unwrap();
        assert_eq!(storage.get(bucket.descriptor()).unwrap(), None);
        assert_eq!(storage.bucket_count(), 0);
    }

    #[test]
    fn test_bounds_per_range() {
        let storage = InMemoryHistoryStorage::new();
        assert_eq!(storage.earliest_bound(HistoryBucketRange::OneMinute), None);
        assert_eq!(storage.time_range(HistoryBucketRange::OneMinute), None);

        for index in [5, -2, 9] {
            store(&storage, bucket(HistoryBucketRange::OneMinute, index));
        }
        store(&storage, bucket(HistoryBucketRange::OneHour, 100));

        let range = HistoryBucketRange::OneMinute;
        assert_eq!(storage.earliest_bound(range).map(|d| d.index()), Some(-2));
        assert_eq!(storage.latest_bound(range).map(|d| d.index()), Some(9));
        assert_eq!(
            storage.time_range(range),
            Some(TimeRange::new(-120_000.0, 600_000.0))
        );
        assert_eq!(storage.first_timestamp(range), Some(-120_000.0));
        assert_eq!(storage.last_timestamp(range), Some(540_100.0));
        assert_eq!(storage.descriptors(range).len(), 3);
    }

    #[test]
    fn test_delete_and_before() {
        let storage = InMemoryHistoryStorage::new();
        for index in 0..5 {
            store(&storage, bucket(HistoryBucketRange::FiveSeconds, index));
        }
        store(&storage, bucket(HistoryBucketRange::OneMinute, 0));

        let deleted = storage.delete_and_before(&HistoryBucketDescriptor::for_index(2, HistoryBucketRange::FiveSeconds));
        let indices: Vec<_> = deleted.iter().map(|d| d.index()).collect();
        assert_eq!(indices, vec![2, 1, 0]);
        assert_eq!(
            storage.earliest_bound(HistoryBucketRange::FiveSeconds).map(|d| d.index()),
            Some(3)
        );
        assert_eq!(storage.bucket_count(), 3);
    }

    #[test]
    fn test_clear_notifies() {
        let storage = InMemoryHistoryStorage::new();
        store(&storage, bucket(HistoryBucketRange::FiveSeconds, 0));
        store(&storage, bucket(HistoryBucketRange::FiveSeconds, 1));

        let notified = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&notified);
        storage.observe(Arc::new(
            move |descriptor: &HistoryBucketDescriptor, _: &HistoryUpdateInfo| {
                recorded.lock().push(*descriptor)
            },
        ));

        storage.clear();
        assert_eq!(storage.bucket_count(), 0);
        assert_eq!(notified.lock().len(), 2);
    }
}
