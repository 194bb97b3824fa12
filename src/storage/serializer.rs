//! Serialization of buckets
//!
//! JSON is the reference format. [`GzipHistoryStorageSerializer`] wraps any
//! serializer and compresses its output.

use crate::bucket::HistoryBucket;
use crate::chunk::{DecimalValues, EnumValues, HistoryChunk, HistoryValues, RecordingType, ReferenceEntryValues};
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::{HistoryError, Result};
use crate::range::{HistoryBucketRange, Millis};
use crate::schema::HistoryConfiguration;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// Writes and reads buckets
pub trait HistoryStorageSerializer: Send + Sync {
    fn serialize(&self, bucket: &HistoryBucket, writer: &mut dyn Write) -> Result<()>;

    fn deserialize(&self, reader: &mut dyn Read) -> Result<HistoryBucket>;

    /// Suffix of the bucket files, including the leading dot
    fn file_extension(&self) -> String;
}

impl<S: HistoryStorageSerializer + ?Sized> HistoryStorageSerializer for Box<S> {
    fn serialize(&self, bucket: &HistoryBucket, writer: &mut dyn Write) -> Result<()> {
        (**self).serialize(bucket, writer)
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<HistoryBucket> {
        (**self).deserialize(reader)
    }

    fn file_extension(&self) -> String {
        (**self).file_extension()
    }
}

/// The JSON projection of a bucket
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializableHistoryBucket<'a> {
    range: HistoryBucketRange,
    start: Millis,
    configuration: Cow<'a, HistoryConfiguration>,
    timestamps: Cow<'a, [Millis]>,
    recording_type: RecordingType,
    decimal: Cow<'a, DecimalValues>,
    enums: Cow<'a, EnumValues>,
    reference_entries: Cow<'a, ReferenceEntryValues>,
}

impl<'a> SerializableHistoryBucket<'a> {
    fn from_bucket(bucket: &'a HistoryBucket) -> Self {
        let chunk = bucket.chunk();
        let values = chunk.values();
        Self {
            range: bucket.bucket_range(),
            start: bucket.start(),
            configuration: Cow::Borrowed(chunk.configuration()),
            timestamps: Cow::Borrowed(chunk.timestamps()),
            recording_type: chunk.recording_type(),
            decimal: Cow::Borrowed(&values.decimal),
            enums: Cow::Borrowed(&values.enums),
            reference_entries: Cow::Borrowed(&values.reference_entries),
        }
    }

    /// Runs all checks of the constructors again
    fn into_bucket(self) -> Result<HistoryBucket> {
        let descriptor = HistoryBucketDescriptor::for_start(self.start, self.range)?;

        let configuration = self.configuration.into_owned();
        configuration.validate()?;

        let values = HistoryValues {
            decimal: self.decimal.into_owned(),
            enums: self.enums.into_owned(),
            reference_entries: self.reference_entries.into_owned(),
        };
        let chunk = HistoryChunk::new(
            configuration,
            self.timestamps.into_owned(),
            values,
            self.recording_type,
        )?;

        HistoryBucket::new(descriptor, chunk)
    }
}

/// Plain JSON, `.json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHistoryStorageSerializer;

impl HistoryStorageSerializer for JsonHistoryStorageSerializer {
    fn serialize(&self, bucket: &HistoryBucket, writer: &mut dyn Write) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        serde_json::to_writer(&mut writer, &SerializableHistoryBucket::from_bucket(bucket))?;
        writer
            .flush()
            .map_err(|source| HistoryError::io(PathBuf::new(), source))
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<HistoryBucket> {
        let serializable: SerializableHistoryBucket<'static> =
            serde_json::from_reader(BufReader::new(reader))
                .map_err(|error| HistoryError::deserialization(PathBuf::new(), error))?;

        serializable
            .into_bucket()
            .map_err(|error| HistoryError::deserialization(PathBuf::new(), error))
    }

    fn file_extension(&self) -> String {
        ".json".to_string()
    }
}

/// Compresses the output of another serializer, `<inner>.gz`
#[derive(Debug, Clone, Default)]
pub struct GzipHistoryStorageSerializer<S> {
    inner: S,
}

impl<S: HistoryStorageSerializer> GzipHistoryStorageSerializer<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: HistoryStorageSerializer> HistoryStorageSerializer for GzipHistoryStorageSerializer<S> {
    fn serialize(&self, bucket: &HistoryBucket, writer: &mut dyn Write) -> Result<()> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        self.inner.serialize(bucket, &mut encoder)?;
        encoder
            .finish()
            .map_err(|source| HistoryError::io(PathBuf::new(), source))?;
        Ok(())
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<HistoryBucket> {
        let mut decoder = GzDecoder::new(reader);
        self.inner.deserialize(&mut decoder)
    }

    fn file_extension(&self) -> String {
        format!("{}.gz", self.inner.file_extension())
    }
}

/// The serializer for plain or compressed files
pub fn serializer_for(compression: bool) -> Box<dyn HistoryStorageSerializer> {
    if compression {
        Box::new(GzipHistoryStorageSerializer::new(JsonHistoryStorageSerializer))
    } else {
        Box::new(JsonHistoryStorageSerializer)
    }
}
