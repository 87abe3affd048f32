//! Full and incremental backup runs.
//!
//! A run hashes every regular file under the source, archives only files whose digest is new or
//! different from the previous run, and then replaces the source's record with the complete
//! digest map. Archives after the first are therefore deltas; `restore::restore_snapshot` replays
//! the recorded history to rebuild the full tree.

use crate::backup::archive::walkdir_globset::{SourceFile, SourceTree};
use crate::backup::archive::{ArchiveEntry, ArchiveWriter, ARCHIVE_FILE_EXT};
use crate::backup::backup_config::{BackupConfig, BackupPair};
use crate::backup::hasher;
use crate::backup::metadata::{source_key, BackupRecord, FileRecords, MetadataStore};
use crate::backup::redacted::non_empty;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use bon::Builder;
use chrono::{DateTime, Local};
use itertools::Itertools;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Timestamp format used in archive names and `last_modified`.
pub static TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Builder)]
pub struct BackupEngine {
    store: Arc<MetadataStore>,
    hash_pool: Arc<ThreadPool>,
    #[builder(default = Arc::from("backup"), into)]
    archive_base_name: Arc<str>,
    compression_level: Option<i64>,
    /// One lock per source key; runs of the same source never overlap.
    #[builder(skip)]
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Outcome of hashing one enumerated file against the previous digest map.
#[derive(Debug)]
enum FileState {
    Changed(SourceFile),
    Unchanged(SourceFile, String),
}

impl BackupEngine {
    pub fn from_config(config: &BackupConfig, hash_pool: Arc<ThreadPool>) -> Self {
        Self::builder()
            .store(Arc::new(MetadataStore::new(&config.metadata_file)))
            .hash_pool(hash_pool)
            .archive_base_name(config.archive_base_name.clone())
            .maybe_compression_level(config.compression_level)
            .build()
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Runs one backup of `job.source` into `job.destination`.
    ///
    /// Files that vanish or cannot be read are skipped and returned as the non-fatal error; the
    /// run still succeeds. Archive finalization or metadata failures abort the run and leave the
    /// previous record and archives untouched.
    ///
    /// Concurrent calls for the same source wait for each other, so every run's archive lands in
    /// the recorded history.
    pub fn run(&self, job: &BackupPair) -> Result<(BackupRecord, Option<Error>)> {
        let lock = self.source_lock(&job.source);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.run_at(job, Local::now())
            .with_debug_object_and_fn_name(job.clone(), "BackupEngine::run")
    }

    fn source_lock(&self, source: &Path) -> Arc<Mutex<()>> {
        self.run_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source_key(source))
            .or_default()
            .clone()
    }

    fn run_at(&self, job: &BackupPair, now: DateTime<Local>) -> Result<(BackupRecord, Option<Error>)> {
        let prior = self.store.get(&job.source)?;
        match &prior {
            None => tracing::info!(source = ?job.source, "Performing full backup"),
            Some(_) => tracing::info!(source = ?job.source, "Performing incremental backup"),
        }
        let prior_files = prior
            .as_ref()
            .map(|r| r.file_records().clone())
            .unwrap_or_default();

        let mut non_fatal = Vec::new();
        let files = SourceTree::builder()
            .src_dir(job.source.clone())
            .exclude(job.exclude.clone())
            .build()
            .files()?
            .filter_map(|res| match res {
                // A destination nested in the source must not archive its own archives.
                Ok(file) if file.path.starts_with(&job.destination) => None,
                Ok(file) => Some(file),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {e}");
                    non_fatal.push(e.with_msg("Ignoring entry"));
                    None
                }
            })
            .collect_vec();

        let (states, hash_errors) = self.classify(files, &prior_files);
        non_fatal.extend(hash_errors);

        let timestamp = now.format(TIME_FORMAT).to_string();
        let archive_path = job.destination.join(format!(
            "{}_{}.{}",
            self.archive_base_name, timestamp, ARCHIVE_FILE_EXT
        ));

        let mut writer = ArchiveWriter::open(
            &archive_path,
            non_empty(job.password.as_ref()),
            self.compression_level,
        )?;
        let (file_records, unchanged, write_errors) = archive_states(&mut writer, states);
        non_fatal.extend(write_errors);
        let changed = writer.entry_count();
        let archive_path = writer.close()?;

        let archive_size_bytes = std::fs::metadata(&archive_path)
            .map_err(Error::from)
            .with_msg(format!("Stat new archive {:?} failed", archive_path))?
            .len();

        let mut history = prior.map(history_of).unwrap_or_default();
        history.push(archive_path.clone());

        let record = BackupRecord::builder()
            .source_directory(job.source.clone())
            .last_archive_path(archive_path.clone())
            .file_records(file_records)
            .archive_size_bytes(archive_size_bytes)
            .last_run_timestamp(timestamp)
            .history(history)
            .build();

        if let Err(e) = self.store.put(record.clone()) {
            if let Err(remove) = std::fs::remove_file(&archive_path) {
                return Err(e.chain(Error::from(remove).with_msg(format!(
                    "Remove orphaned archive {:?} failed",
                    archive_path
                ))));
            }
            return Err(e);
        }

        tracing::info!(
            source = ?job.source,
            archive = ?archive_path,
            changed,
            unchanged,
            skipped = non_fatal.len(),
            "Backup completed"
        );
        Ok((record, convert_error_vec(non_fatal).err()))
    }

    /// Hashes files on the pool and compares against the previous map. Per-file failures are
    /// returned separately and never abort the run.
    fn classify(&self, files: Vec<SourceFile>, prior: &FileRecords) -> (Vec<FileState>, Vec<Error>) {
        let hashed: Vec<(SourceFile, Result<String>)> = self.hash_pool.install(|| {
            files
                .into_par_iter()
                .map(|file| {
                    let digest = hasher::digest(&file.path);
                    (file, digest)
                })
                .collect()
        });

        let mut errors = Vec::new();
        let states = hashed
            .into_iter()
            .filter_map(|(file, digest)| match digest {
                Ok(digest) => Some(match prior.get(&file.relative) {
                    Some(old) if *old == digest => {
                        tracing::trace!("Unchanged {:?}", file.relative);
                        FileState::Unchanged(file, digest)
                    }
                    _ => FileState::Changed(file),
                }),
                Err(e) => {
                    tracing::warn!("Skipping {:?}: {e}", file.path);
                    errors.push(e);
                    None
                }
            })
            .collect();
        (states, errors)
    }
}

/// Writes changed files into `writer` and collects the new digest map. Files that fail while being
/// archived are left out of the map and returned as errors. Also returns the unchanged count.
fn archive_states(
    writer: &mut ArchiveWriter,
    states: Vec<FileState>,
) -> (FileRecords, usize, Vec<Error>) {
    let mut file_records = FileRecords::new();
    let mut unchanged = 0usize;
    let mut errors = Vec::new();
    for state in states {
        match state {
            FileState::Unchanged(file, digest) => {
                unchanged += 1;
                file_records.insert(file.relative, digest);
            }
            FileState::Changed(file) => {
                let entry = ArchiveEntry::new(file.path.as_path(), file.relative.as_str());
                match writer.write_entry(&entry) {
                    Ok(digest) => {
                        tracing::debug!("Archived changed file {:?}", file.relative);
                        file_records.insert(file.relative, digest);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping {:?}: {e}", file.path);
                        errors.push(e);
                    }
                }
            }
        }
    }
    (file_records, unchanged, errors)
}

/// Archive history of an existing record; documents written before history was tracked only know
/// their last archive.
fn history_of(record: BackupRecord) -> Vec<PathBuf> {
    if record.history().is_empty() {
        vec![record.last_archive_path().clone()]
    } else {
        record.history().clone()
    }
}
