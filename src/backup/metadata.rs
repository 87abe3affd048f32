//! Persisted per-source backup state.
//!
//! The document is a JSON object keyed by source directory:
//!
//! ```json
//! {
//!   "/home/me/docs": {
//!     "last_backup": "/mnt/backups/backup_2024-05-01_10-00-00.zip",
//!     "file_hashes": { "a.txt": "<sha256 hex>" },
//!     "size": 1234,
//!     "last_modified": "2024-05-01_10-00-00",
//!     "history": ["/mnt/backups/backup_2024-05-01_10-00-00.zip"]
//!   }
//! }
//! ```

use crate::backup::atomic_file::write_json_atomic;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub type FileRecords = BTreeMap<String, String>;

/// Summary of the most recent successful run for one source directory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters)]
#[getset(get = "pub")]
pub struct BackupRecord {
    /// Filled from the document key on load.
    #[serde(skip)]
    #[builder(into)]
    source_directory: PathBuf,
    #[serde(rename = "last_backup")]
    #[builder(into)]
    last_archive_path: PathBuf,
    /// Complete relative path -> digest map of the tree as of this run.
    #[serde(rename = "file_hashes")]
    #[builder(default)]
    file_records: FileRecords,
    #[serde(rename = "size")]
    archive_size_bytes: u64,
    #[serde(rename = "last_modified")]
    #[builder(into)]
    last_run_timestamp: String,
    /// Every archive produced for this source, oldest first.
    #[serde(default)]
    #[builder(default)]
    history: Vec<PathBuf>,
}

pub type BackupMetadata = BTreeMap<String, BackupRecord>;

/// Document key of a source directory. `src`, `src/` and `src/./` share one key.
pub fn source_key<P: AsRef<Path>>(source_directory: P) -> String {
    source_directory
        .as_ref()
        .components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

/// Single writer of the backup metadata document.
///
/// `update` serializes read-modify-write cycles of concurrent runs so one source's record never
/// clobbers another's.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empty mapping when nothing was persisted yet; `CorruptState` when the document exists but
    /// cannot be parsed.
    pub fn load(&self) -> Result<BackupMetadata> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No backup metadata at {:?}, starting empty", self.path);
                return Ok(BackupMetadata::new());
            }
            Err(e) => {
                return Err(Error::from(e)
                    .with_msg(format!("Read backup metadata {:?} failed", self.path)))
            }
        };

        let mut metadata: BackupMetadata =
            serde_json::from_slice(&bytes).map_err(|e| Error::CorruptState {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        metadata
            .iter_mut()
            .for_each(|(key, record)| record.source_directory = PathBuf::from(key));
        Ok(metadata)
    }

    pub fn get<P: AsRef<Path>>(&self, source_directory: P) -> Result<Option<BackupRecord>> {
        Ok(self.load()?.remove(&source_key(source_directory)))
    }

    /// Replaces the whole persisted mapping atomically.
    pub fn save(&self, metadata: &BackupMetadata) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.save_unlocked(metadata)
    }

    /// Locked load -> modify -> save. Nothing is written when `f` fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BackupMetadata) -> Result<T>,
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut metadata = self.load()?;
        let res = f(&mut metadata)?;
        self.save_unlocked(&metadata)?;
        Ok(res)
    }

    pub fn put(&self, record: BackupRecord) -> Result<()> {
        self.update(|metadata| {
            metadata.insert(source_key(&record.source_directory), record);
            Ok(())
        })
    }

    fn save_unlocked(&self, metadata: &BackupMetadata) -> Result<()> {
        write_json_atomic(&self.path, metadata)
            .with_msg(format!("Save backup metadata {:?} failed", self.path))
    }
}

impl BackupRecord {
    /// Newest archive first is what an operator usually wants to pick from.
    pub fn archives_newest_first(&self) -> impl Iterator<Item = &PathBuf> {
        self.history.iter().rev()
    }
}
