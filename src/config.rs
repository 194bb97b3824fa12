//! Configuration handling for meister-history
//!
//! Values are resolved in this order: command line, environment variables,
//! config file (`~/.config/meister-history/config.toml`), defaults.

use crate::error::{HistoryError, Result};
use crate::storage::file::FileHistoryStorage;
use crate::storage::serializer::serializer_for;
use clap::Args;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default delay between two down sampling runs
pub const DEFAULT_DOWN_SAMPLING_DELAY: Duration = Duration::from_millis(500);

/// Default number of buckets kept by the read cache
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Storage options that can be set on the command line or via environment variables
#[derive(Args, Debug, Clone, Default)]
pub struct StorageArgs {
    /// Config file (default: ~/.config/meister-history/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory that contains the bucket files
    #[arg(long, env = "HISTORY_BASE_DIR", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Compress bucket files with gzip
    #[arg(long, env = "HISTORY_COMPRESSION", global = true)]
    pub compression: Option<bool>,

    /// Delay between two down sampling runs in milliseconds
    #[arg(long = "down-sampling-delay-ms", env = "HISTORY_DOWNSAMPLING_DELAY_MS", global = true)]
    pub down_sampling_delay_ms: Option<u64>,

    /// Number of buckets kept in the read cache
    #[arg(long, env = "HISTORY_CACHE_CAPACITY", global = true)]
    pub cache_capacity: Option<usize>,
}

/// Contents of the config file. All keys are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_dir: Option<PathBuf>,
    pub compression: Option<bool>,
    pub down_sampling_delay_ms: Option<u64>,
    pub cache_capacity: Option<usize>,
}

impl FileConfig {
    /// Loads the file. A missing file yields the empty config, a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config file at {:?}", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(HistoryError::io(path, e)),
        };

        toml::from_str(&contents)
            .map_err(|e| HistoryError::InvalidConfig(format!("failed to parse {:?}: {}", path, e)))
    }
}

/// Resolved storage configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
    pub compression: bool,
    pub down_sampling_delay: Duration,
    pub cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            compression: true,
            down_sampling_delay: DEFAULT_DOWN_SAMPLING_DELAY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// Reads the config file named by the arguments (or the default one) and applies the arguments
    pub fn load(args: &StorageArgs) -> Result<Self> {
        let path = args.config.clone().unwrap_or_else(default_config_file);
        let file_config = FileConfig::load(&path)?;
        Self::resolve(args, &file_config)
    }

    /// Arguments win over the file, the file wins over the defaults
    pub fn resolve(args: &StorageArgs, file_config: &FileConfig) -> Result<Self> {
        let defaults = Self::default();
        let delay_ms = args.down_sampling_delay_ms.or(file_config.down_sampling_delay_ms);
        if delay_ms == Some(0) {
            return Err(HistoryError::InvalidConfig(
                "down sampling delay must be greater than zero".to_string(),
            ));
        }

        let config = Self {
            base_dir: args
                .base_dir
                .clone()
                .or_else(|| file_config.base_dir.clone())
                .unwrap_or(defaults.base_dir),
            compression: args
                .compression
                .or(file_config.compression)
                .unwrap_or(defaults.compression),
            down_sampling_delay: delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.down_sampling_delay),
            cache_capacity: args
                .cache_capacity
                .or(file_config.cache_capacity)
                .unwrap_or(defaults.cache_capacity),
        };
        debug!("Resolved storage config: {:?}", config);
        Ok(config)
    }

    /// Creates the base directory if required and opens the file storage
    pub fn open_storage(&self) -> Result<FileHistoryStorage> {
        fs::create_dir_all(&self.base_dir).map_err(|e| HistoryError::io(&self.base_dir, e))?;
        FileHistoryStorage::open(&self.base_dir, serializer_for(self.compression))
    }
}

/// Get the data directory for meister-history
fn default_base_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meister-history")
}

fn default_config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meister-history")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        storage: StorageArgs,
    }

    #[test]
    fn test_defaults() {
        let config = StorageConfig::resolve(&StorageArgs::default(), &FileConfig::default()).unwrap();
        assert!(config.compression);
        assert_eq!(config.down_sampling_delay, Duration::from_millis(500));
        assert_eq!(config.cache_capacity, 1000);
        assert!(config.base_dir.ends_with("meister-history"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file_config: FileConfig = toml::from_str(
            r#"
            base_dir = "/var/lib/history"
            compression = false
            down_sampling_delay_ms = 2000
            "#,
        )
        .unwrap();

        let config = StorageConfig::resolve(&StorageArgs::default(), &file_config).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/history"));
        assert!(!config.compression);
        assert_eq!(config.down_sampling_delay, Duration::from_secs(2));
        assert_eq!(config.cache_capacity, 1000);
    }

    #[test]
    fn test_args_override_file() {
        let file_config = FileConfig {
            base_dir: Some(PathBuf::from("/from/file")),
            cache_capacity: Some(10),
            ..Default::default()
        };
        let args = TestCli::try_parse_from([
            "test",
            "--base-dir",
            "/from/args",
            "--cache-capacity",
            "20",
            "--compression",
            "false",
        ])
        .unwrap()
        .storage;

        let config = StorageConfig::resolve(&args, &file_config).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/from/args"));
        assert_eq!(config.cache_capacity, 20);
        assert!(!config.compression);
    }

    #[test]
    fn test_zero_delay_is_rejected() {
        let args = StorageArgs {
            down_sampling_delay_ms: Some(0),
            ..Default::default()
        };
        let result = StorageConfig::resolve(&args, &FileConfig::default());
        assert!(matches!(result, Err(HistoryError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_and_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        assert!(FileConfig::load(&missing).unwrap().base_dir.is_none());

        let malformed = temp_dir.path().join("malformed.toml");
        fs::write(&malformed, "compression = \"maybe\"").unwrap();
        assert!(matches!(
            FileConfig::load(&malformed),
            Err(HistoryError::InvalidConfig(_))
        ));

        let unknown = temp_dir.path().join("unknown.toml");
        fs::write(&unknown, "retention_days = 3").unwrap();
        assert!(FileConfig::load(&unknown).is_err());
    }

    #[test]
    fn test_load_and_open_storage() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("config.toml");
        let base_dir = temp_dir.path().join("data").join("history");
        fs::write(
            &config_file,
            format!("base_dir = {:?}\ncompression = false\n", base_dir.to_string_lossy()),
        )
        .unwrap();

        let args = StorageArgs {
            config: Some(config_file),
            ..Default::default()
        };
        let config = StorageConfig::load(&args).unwrap();
        assert_eq!(config.base_dir, base_dir);

        let storage = config.open_storage().unwrap();
        assert!(base_dir.is_dir());
        assert_eq!(storage.base_dir(), base_dir.as_path());
    }
}
