//! File based history storage
//!
//! Every bucket is stored in its own file. The files are grouped by calendar
//! unit so that a directory never holds more than a few hundred entries.
//!
//! Storage location: {base_dir}/{RangeName}/YYYY/MM/DD/...{leaf}.json[.gz]

use super::layout;
use super::serializer::HistoryStorageSerializer;
use super::{
    DisposeAction, DisposeSupport, HistoryObserver, HistoryStorage, ObservableHistoryStorage,
    ObserverList, WritableHistoryStorage,
};
use crate::bucket::{HistoryBucket, HistoryUpdateInfo};
use crate::descriptor::HistoryBucketDescriptor;
use crate::downsampling::{scheduling_handle, DownSamplingService};
use crate::error::{HistoryError, Result};
use crate::range::HistoryBucketRange;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Makes the names of temporary files unique within the process
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stores history buckets as files below a base directory
pub struct FileHistoryStorage {
    /// Existing directory that contains one sub directory per bucket range
    base_dir: PathBuf,
    /// Format of the bucket files
    serializer: Box<dyn HistoryStorageSerializer>,
    observers: ObserverList,
    /// Buckets stored since the last call to [`FileHistoryStorage::get_updates`]
    pending_updates: Mutex<Vec<HistoryBucket>>,
    dispose_support: DisposeSupport,
    /// Cancelled on dispose, background tasks use child tokens
    cancellation: CancellationToken,
    down_sampling_scheduled: AtomicBool,
}

impl FileHistoryStorage {
    /// Opens the storage. The base directory must exist.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        serializer: impl HistoryStorageSerializer + 'static,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.is_dir() {
            return Err(HistoryError::InvalidConfig(format!(
                "base directory {:?} does not exist or is not a directory",
                base_dir
            )));
        }

        info!(
            "Opened file history storage at {:?} ({} files)",
            base_dir,
            serializer.file_extension()
        );

        Ok(Self {
            base_dir,
            serializer: Box::new(serializer),
            observers: ObserverList::new(),
            pending_updates: Mutex::new(Vec::new()),
            dispose_support: DisposeSupport::new(),
            cancellation: CancellationToken::new(),
            down_sampling_scheduled: AtomicBool::new(false),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The file the bucket for the descriptor is stored in
    pub fn get_file(&self, descriptor: &HistoryBucketDescriptor) -> Result<PathBuf> {
        layout::bucket_file(&self.base_dir, descriptor, &self.serializer.file_extension())
    }

    /// The directory that contains the file of the descriptor
    pub fn get_parent_file(&self, descriptor: &HistoryBucketDescriptor) -> Result<PathBuf> {
        layout::bucket_directory(&self.base_dir, descriptor)
    }

    /// Returns the buckets that have been stored since the last call and clears the list
    pub fn get_updates(&self) -> Vec<HistoryBucket> {
        std::mem::take(&mut *self.pending_updates.lock())
    }

    /// A token that is cancelled when this storage is disposed
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    /// Stops background work and runs the dispose actions
    pub fn dispose(&self) {
        if self.dispose_support.is_disposed() {
            return;
        }
        info!("Disposing file history storage at {:?}", self.base_dir);
        self.cancellation.cancel();
        self.dispose_support.dispose();
    }

    /// Starts the periodic down sampling for this storage.
    ///
    /// Must be called within a tokio runtime. Stopped by [`FileHistoryStorage::dispose`].
    pub fn schedule_down_sampling(
        self: &Arc<Self>,
        delay: Duration,
    ) -> Result<Arc<DownSamplingService<FileHistoryStorage>>> {
        // Checked before the service registers its observer
        scheduling_handle(delay)?;
        if self.down_sampling_scheduled.swap(true, Ordering::SeqCst) {
            return Err(HistoryError::AlreadyScheduled);
        }

        let service = Arc::new(DownSamplingService::new(Arc::clone(self)));
        if let Err(error) = service.schedule(delay, self.cancellation_token()) {
            self.down_sampling_scheduled.store(false, Ordering::SeqCst);
            return Err(error);
        }
        Ok(service)
    }

    /// All bucket files of the range, sorted by path
    pub fn stored_files(&self, range: HistoryBucketRange) -> Result<Vec<PathBuf>> {
        let range_dir = self.base_dir.join(range.name());
        let mut files = Vec::new();
        if !range_dir.exists() {
            return Ok(files);
        }

        collect_files(&range_dir, &self.serializer.file_extension(), &mut files)
            .map_err(|source| HistoryError::io(&range_dir, source))?;
        files.sort();
        Ok(files)
    }

    /// Descriptors of all stored buckets of the range, sorted by start
    pub fn stored_descriptors(&self, range: HistoryBucketRange) -> Result<Vec<HistoryBucketDescriptor>> {
        let mut descriptors: Vec<_> = self
            .stored_files(range)?
            .iter()
            .filter_map(|file| layout::parse_bucket_file(&self.base_dir, file, range))
            .collect();
        descriptors.sort();
        Ok(descriptors)
    }

    fn write_atomically(&self, path: &Path, bucket: &HistoryBucket) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| HistoryError::InvalidDescriptor(format!("invalid file {:?}", path)))?;
        let temp_path = path.with_file_name(format!(
            ".{}.tmp-{}-{}",
            file_name,
            std::process::id(),
            TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = self.write_file(&temp_path, bucket).and_then(|()| {
            fs::rename(&temp_path, path).map_err(|source| HistoryError::io(path, source))
        });

        if result.is_err() {
            // Nothing to do if the temp file is missing
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    fn write_file(&self, path: &Path, bucket: &HistoryBucket) -> Result<()> {
        let file = File::create(path).map_err(|source| HistoryError::io(path, source))?;
        let mut writer = BufWriter::new(file);
        self.serializer
            .serialize(bucket, &mut writer)
            .map_err(|error| error.at(path))?;
        writer
            .flush()
            .map_err(|source| HistoryError::io(path, source))?;
        Ok(())
    }
}

impl HistoryStorage for FileHistoryStorage {
    fn get(&self, descriptor: &HistoryBucketDescriptor) -> Result<Option<HistoryBucket>> {
        let path = self.get_file(descriptor)?;

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("No bucket stored for {}", descriptor);
                return Ok(None);
            }
            Err(source) => return Err(HistoryError::io(path, source)),
        };

        let mut reader = BufReader::new(file);
        let bucket = self
            .serializer
            .deserialize(&mut reader)
            .map_err(|error| error.at(&path))?;

        if bucket.descriptor() != descriptor {
            return Err(HistoryError::deserialization(
                path,
                format!("contains {} instead of {}", bucket.descriptor(), descriptor),
            ));
        }
        Ok(Some(bucket))
    }
}

impl WritableHistoryStorage for FileHistoryStorage {
    fn store_without_cache(&self, bucket: HistoryBucket, update_info: HistoryUpdateInfo) -> Result<()> {
        let descriptor = *bucket.descriptor();
        let directory = self.get_parent_file(&descriptor)?;
        fs::create_dir_all(&directory).map_err(|source| HistoryError::io(&directory, source))?;

        let path = self.get_file(&descriptor)?;
        self.write_atomically(&path, &bucket)?;
        debug!(
            "Stored {} ({} samples) to {:?}",
            descriptor,
            bucket.chunk().timestamps_count(),
            path
        );

        self.pending_updates.lock().push(bucket);
        self.observers.notify(&descriptor, &update_info);
        Ok(())
    }

    fn delete(&self, descriptor: &HistoryBucketDescriptor) -> Result<()> {
        let path = self.get_file(descriptor)?;
        match fs::remove_file(&path) {
            Ok(()) => debug!("Deleted {:?}", path),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("Nothing to delete for {}", descriptor)
            }
            Err(source) => return Err(HistoryError::io(path, source)),
        }

        self.observers
            .notify(descriptor, &HistoryUpdateInfo::from_descriptor(descriptor));
        Ok(())
    }
}

impl ObservableHistoryStorage for FileHistoryStorage {
    fn observe(&self, observer: HistoryObserver) {
        self.observers.add(observer);
    }

    fn on_dispose(&self, action: DisposeAction) {
        self.dispose_support.on_dispose(action);
    }
}

/// Recursively collects the files with the extension, skipping temporary files
fn collect_files(dir: &Path, extension: &str, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            collect_files(&path, extension, files)?;
            continue;
        }

        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with('.') && name.ends_with(extension) {
            files.push(path);
        }
    }
    Ok(())
}
