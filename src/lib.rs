//! meister-history - time bucketed history storage with multi-resolution down sampling
//!
//! Samples are stored in buckets. Every [`range::HistoryBucketRange`] holds a fixed
//! number of samples; coarser ranges are calculated from the finer ones by the
//! [`downsampling::DownSamplingService`].

pub mod bucket;
pub mod chunk;
pub mod config;
pub mod descriptor;
pub mod downsampling;
pub mod error;
pub mod export;
pub mod generator;
pub mod range;
pub mod schema;
pub mod storage;
pub mod time_range;

pub use bucket::{HistoryBucket, HistoryUpdateInfo};
pub use chunk::{HistoryChunk, HistoryChunkBuilder};
pub use descriptor::HistoryBucketDescriptor;
pub use error::{HistoryError, Result};
pub use range::{HistoryBucketRange, Millis, SamplingPeriod};
pub use schema::HistoryConfiguration;
pub use time_range::{TimeRange, TimeRanges};
