//! Storage contracts and implementations
//!
//! - [`file::FileHistoryStorage`] persists every bucket in its own file
//! - [`memory::InMemoryHistoryStorage`] keeps the buckets in a map
//! - [`cache`] contains a read cache and a write buffer for both

pub mod cache;
pub mod file;
pub mod layout;
pub mod memory;
pub mod serializer;

use crate::bucket::{HistoryBucket, HistoryUpdateInfo};
use crate::chunk::HistoryChunk;
use crate::descriptor::{HistoryBucketDescriptor, MAX_SUPPORTED_DESCRIPTORS_COUNT};
use crate::error::Result;
use crate::range::{Millis, SamplingPeriod};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Called after every store or delete, on the thread of the writer
pub type HistoryObserver = Arc<dyn Fn(&HistoryBucketDescriptor, &HistoryUpdateInfo) + Send + Sync>;

/// Called once when the storage is disposed
pub type DisposeAction = Box<dyn FnOnce() + Send>;

/// Read access to buckets
pub trait HistoryStorage: Send + Sync {
    /// Returns the bucket, `None` if nothing has been stored for the descriptor
    fn get(&self, descriptor: &HistoryBucketDescriptor) -> Result<Option<HistoryBucket>>;

    /// Returns the existing buckets, missing ones are omitted
    fn get_many(&self, descriptors: &[HistoryBucketDescriptor]) -> Result<Vec<HistoryBucket>> {
        let mut buckets = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if let Some(bucket) = self.get(descriptor)? {
                buckets.push(bucket);
            }
        }
        Ok(buckets)
    }

    /// Returns the buckets of the sampling period that cover `[start, end]`
    fn query(
        &self,
        start: Millis,
        end: Millis,
        sampling_period: SamplingPeriod,
    ) -> Result<Vec<HistoryBucket>> {
        let descriptors = HistoryBucketDescriptor::for_range(
            start,
            end,
            sampling_period.to_bucket_range(),
            true,
            MAX_SUPPORTED_DESCRIPTORS_COUNT,
        )?;
        self.get_many(&descriptors)
    }
}

/// Write access to buckets
pub trait WritableHistoryStorage: HistoryStorage {
    /// Replaces the bucket and notifies the observers
    fn store_without_cache(&self, bucket: HistoryBucket, update_info: HistoryUpdateInfo) -> Result<()>;

    /// Removes the bucket. Deleting a missing bucket is not an error.
    fn delete(&self, descriptor: &HistoryBucketDescriptor) -> Result<()>;

    /// Splits the chunk into buckets, merges them with the stored buckets and stores the result.
    ///
    /// Returns the descriptors of the stored buckets.
    fn store_chunk(
        &self,
        chunk: &HistoryChunk,
        sampling_period: SamplingPeriod,
    ) -> Result<Vec<HistoryBucketDescriptor>> {
        let descriptors = HistoryBucketDescriptor::from_chunk(chunk, sampling_period);

        for descriptor in &descriptors {
            let part = chunk.range(descriptor.start(), descriptor.end());
            let update_info = HistoryUpdateInfo::from_chunk(&part, sampling_period);

            let merged = match self.get(descriptor)? {
                Some(existing) if existing.chunk().configuration() == part.configuration() => {
                    existing.chunk().merge(&part)?
                }
                Some(_) => {
                    debug!("Replacing {} - configuration changed", descriptor);
                    part
                }
                None => part,
            };

            self.store_without_cache(HistoryBucket::new(*descriptor, merged)?, update_info)?;
        }

        Ok(descriptors)
    }
}

/// Notifies observers about changes
pub trait ObservableHistoryStorage {
    fn observe(&self, observer: HistoryObserver);

    /// Registers an action that is run when the storage is disposed
    fn on_dispose(&self, action: DisposeAction);
}

/// Observers, notified in registration order
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<HistoryObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: HistoryObserver) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Calls every observer. A panicking observer is logged and does not stop the others.
    pub fn notify(&self, descriptor: &HistoryBucketDescriptor, update_info: &HistoryUpdateInfo) {
        // Observers may register further observers
        let observers = self.observers.read().clone();

        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer(descriptor, update_info))).is_err() {
                warn!("Observer #{} panicked while handling {}", index, descriptor);
            }
        }
    }
}

/// Runs registered actions once
#[derive(Default)]
pub struct DisposeSupport {
    actions: Mutex<Vec<DisposeAction>>,
    disposed: Mutex<bool>,
}

impl DisposeSupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action. Runs it immediately if already disposed.
    pub fn on_dispose(&self, action: DisposeAction) {
        if *self.disposed.lock() {
            action();
            return;
        }
        self.actions.lock().push(action);
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.lock()
    }

    /// Runs all actions, in reverse registration order
    pub fn dispose(&self) {
        {
            let mut disposed = self.disposed.lock();
            if *disposed {
                return;
            }
            *disposed = true;
        }

        let actions = std::mem::take(&mut *self.actions.lock());
        for action in actions.into_iter().rev() {
            action();
        }
    }
}
