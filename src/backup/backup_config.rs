use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::validate::{
    validate_dir_exist, validate_dir_exist_or_created, validate_globs,
    validate_valid_archive_base_name,
};
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationError};

static DEFAULT_METADATA_FILE: &str = "backup_metadata.json";
static DEFAULT_MONITORING_FILE: &str = "monitoring_list.json";
static DEFAULT_ARCHIVE_BASE_NAME: &str = "backup";
/// Quiet period before a changed directory is backed up.
pub static DEFAULT_QUIESCENCE_WINDOW: Duration = Duration::from_secs(300);
static DEFAULT_WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Everything the engine and scheduler need, loaded once at startup.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_no_duplicate_sources))]
pub struct BackupConfig {
    #[validate(length(min = 1, message = "no directories configured"), nested)]
    pub directories: Vec<BackupPair>,
    #[serde(default = "default_metadata_file")]
    #[builder(default = default_metadata_file(), into)]
    pub metadata_file: PathBuf,
    #[serde(default = "default_monitoring_file")]
    #[builder(default = default_monitoring_file(), into)]
    pub monitoring_file: PathBuf,
    #[serde(default = "default_quiescence_window", with = "humantime_serde")]
    #[builder(default = DEFAULT_QUIESCENCE_WINDOW)]
    pub quiescence_window: Duration,
    #[serde(default = "default_watch_retry_interval", with = "humantime_serde")]
    #[builder(default = DEFAULT_WATCH_RETRY_INTERVAL)]
    pub watch_retry_interval: Duration,
    #[serde(default = "default_archive_base_name")]
    #[validate(custom(function = validate_archive_base_name))]
    #[builder(default = default_archive_base_name(), into)]
    pub archive_base_name: Arc<str>,
    #[validate(range(min = 0, max = 9))]
    pub compression_level: Option<i64>,
}

/// One source -> destination backup job.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_pair_distinct))]
pub struct BackupPair {
    #[validate(custom(function = validate_source))]
    #[builder(into)]
    pub source: PathBuf,
    #[validate(custom(function = validate_destination))]
    #[builder(into)]
    pub destination: PathBuf,
    #[validate(nested)]
    #[builder(into)]
    pub password: Option<RedactedString>,
    #[serde(default)]
    #[validate(custom(function = validate_exclude))]
    #[builder(default, into)]
    pub exclude: Vec<String>,
}

fn default_metadata_file() -> PathBuf {
    DEFAULT_METADATA_FILE.into()
}

fn default_monitoring_file() -> PathBuf {
    DEFAULT_MONITORING_FILE.into()
}

fn default_quiescence_window() -> Duration {
    DEFAULT_QUIESCENCE_WINDOW
}

fn default_watch_retry_interval() -> Duration {
    DEFAULT_WATCH_RETRY_INTERVAL
}

fn default_archive_base_name() -> Arc<str> {
    DEFAULT_ARCHIVE_BASE_NAME.into()
}

fn validate_archive_base_name(name: &Arc<str>) -> std::result::Result<(), ValidationError> {
    validate_valid_archive_base_name(name.as_ref())
}

fn validate_source(dir: &PathBuf) -> std::result::Result<(), ValidationError> {
    validate_dir_exist(dir)
}

fn validate_destination(dir: &PathBuf) -> std::result::Result<(), ValidationError> {
    validate_dir_exist_or_created(dir)
}

fn validate_exclude(globs: &Vec<String>) -> std::result::Result<(), ValidationError> {
    validate_globs(globs)
}

fn validate_pair_distinct(pair: &BackupPair) -> std::result::Result<(), ValidationError> {
    if pair.source == pair.destination {
        return Err(ValidationError::new("InvalidPair").with_message(
            format!("destination {:?} is the source directory", pair.destination).into(),
        ));
    }
    Ok(())
}

fn validate_no_duplicate_sources(config: &BackupConfig) -> std::result::Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for pair in &config.directories {
        if !seen.insert(&pair.source) {
            return Err(ValidationError::new("DuplicateSource")
                .with_message(format!("{:?} is configured twice", pair.source).into()));
        }
    }
    Ok(())
}

impl BackupConfig {
    /// Parses by extension (`.yml`/`.yaml` as YAML, anything else as JSON) and validates.
    ///
    /// Every failure is reported as a configuration error before any watch or backup starts.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Configuration(format!("cannot read config file {:?}: {}", path, e))
        })?;

        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        let config: BackupConfig = if is_yaml {
            serde_yml::from_slice(&bytes).map_err(|e| Error::Configuration(e.to_string()))
        } else {
            serde_json::from_slice(&bytes).map_err(|e| Error::Configuration(e.to_string()))
        }
        .with_msg(format!("Parse config failed: {:?}", path))?;

        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        self.validate().map_err(Error::from)
    }

    pub fn pair_for<P: AsRef<Path>>(&self, source: P) -> Option<&BackupPair> {
        self.directories
            .iter()
            .find(|pair| pair.source == source.as_ref())
    }
}
