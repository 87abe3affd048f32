//! Entry points used by the CLI and other front ends.

use crate::backup::backup_config::{BackupConfig, BackupPair};
use crate::backup::engine::BackupEngine;
use crate::backup::metadata::BackupRecord;
use crate::backup::redacted::RedactedString;
use crate::backup::restore;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::scheduler::{BackupRunner, DebounceScheduler};
use crate::backup::watch_set::WatchSet;
use crate::backup::watcher::DirectoryWatcher;
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct BackupService {
    config: BackupConfig,
    engine: Arc<BackupEngine>,
}

/// A running watch: the directory watcher plus the scheduler consuming its events.
pub struct WatchHandle {
    directories: Vec<PathBuf>,
    watcher: DirectoryWatcher,
    scheduler: DebounceScheduler,
}

impl WatchHandle {
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Ends event delivery, drops pending backups and waits for running ones.
    pub fn stop(self) {
        self.watcher.stop();
        self.scheduler.shutdown();
        tracing::info!(directories = self.directories.len(), "Watch stopped");
    }
}

impl BackupService {
    /// Validates `config` and prepares the engine. Fails before anything is watched or written.
    pub fn new(config: BackupConfig) -> Result<Self> {
        config.check()?;
        let hash_pool = ThreadPoolBuilder::new()
            .thread_name(|i| format!("hash-{i}"))
            .build()?;
        let engine = BackupEngine::from_config(&config, Arc::new(hash_pool));
        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<BackupEngine> {
        &self.engine
    }

    fn configured_pair(&self, source: &Path) -> Result<&BackupPair> {
        self.config.pair_for(source).ok_or_else(|| {
            Error::Configuration(format!("{:?} is not a configured source directory", source))
        })
    }

    /// Backs up `source` into `destination` and adds `source` to the watch set.
    ///
    /// Exclusions configured for `source` still apply. Skipped files are logged, not returned.
    pub fn create_backup<P1: AsRef<Path>, P2: AsRef<Path>>(
        &self,
        source: P1,
        destination: P2,
        password: Option<&RedactedString>,
    ) -> Result<BackupRecord> {
        let source = source.as_ref();
        let job = BackupPair::builder()
            .source(source)
            .destination(destination.as_ref())
            .maybe_password(password.cloned())
            .exclude(
                self.config
                    .pair_for(source)
                    .map(|pair| pair.exclude.clone())
                    .unwrap_or_default(),
            )
            .build();
        let record = self.engine.run_backup(&job)?;
        self.watch_set()?.add(source)?;
        Ok(record)
    }

    /// Backs up a configured source with its configured destination and password.
    pub fn backup_configured<P: AsRef<Path>>(&self, source: P) -> Result<BackupRecord> {
        let pair = self.configured_pair(source.as_ref())?;
        self.create_backup(&pair.source, &pair.destination, pair.password.as_ref())
    }

    pub fn restore_backup<P1: AsRef<Path>, P2: AsRef<Path>>(
        &self,
        archive_path: P1,
        destination: P2,
        password: Option<&RedactedString>,
    ) -> Result<usize> {
        restore::restore(archive_path, destination, password)
    }

    /// Rebuilds the last recorded state of `source` from its whole archive history.
    pub fn restore_snapshot<P1: AsRef<Path>, P2: AsRef<Path>>(
        &self,
        source: P1,
        destination: P2,
        password: Option<&RedactedString>,
    ) -> Result<usize> {
        let source = source.as_ref();
        let record = self
            .history(source)?
            .ok_or_else(|| Error::NotFound(source.to_path_buf()))?;
        restore::restore_snapshot(&record, destination, password)
    }

    pub fn history<P: AsRef<Path>>(&self, source: P) -> Result<Option<BackupRecord>> {
        self.engine.store().get(source)
    }

    /// Password configured for the destination directory holding `archive_path`, if any.
    pub fn configured_password_for<P: AsRef<Path>>(&self, archive_path: P) -> Option<&RedactedString> {
        let dir = archive_path.as_ref().parent()?;
        self.config
            .directories
            .iter()
            .find(|pair| pair.destination == dir)
            .and_then(|pair| pair.password.as_ref())
    }

    pub fn watch_set(&self) -> Result<WatchSet> {
        WatchSet::load(&self.config.monitoring_file)
    }

    /// Configured sources in the watch set, or every configured source when the set is empty.
    pub fn default_watch_directories(&self) -> Result<Vec<PathBuf>> {
        let watch_set = self.watch_set()?;
        let sources = self.config.directories.iter().map(|pair| pair.source.clone());
        if watch_set.is_empty() {
            return Ok(sources.collect_vec());
        }
        for dir in watch_set.directories() {
            if self.config.pair_for(dir).is_none() {
                tracing::warn!(directory = ?dir, "In the watch set but not configured, ignoring");
            }
        }
        Ok(sources.filter(|s| watch_set.contains(s)).collect_vec())
    }

    /// Starts watching `directories` (each must be a configured source) and records them in the
    /// watch set.
    pub fn start_watch<I, P>(&self, directories: I) -> Result<WatchHandle>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let jobs = directories
            .into_iter()
            .map(|dir| self.configured_pair(dir.as_ref()).cloned())
            .collect::<Result<Vec<_>>>()?;
        if jobs.is_empty() {
            return Err(Error::Configuration("no directories to watch".to_string()));
        }

        let mut watch_set = self.watch_set()?;
        for job in &jobs {
            watch_set.add(&job.source)?;
        }

        let directories = jobs.iter().map(|job| job.source.clone()).collect_vec();
        let (watcher, events) =
            DirectoryWatcher::watch(directories.clone(), self.config.watch_retry_interval)?;
        let scheduler = DebounceScheduler::spawn(
            jobs,
            self.config.quiescence_window,
            self.engine.clone(),
            events,
        )?;
        tracing::info!(directories = directories.len(), "Watch started");
        Ok(WatchHandle {
            directories,
            watcher,
            scheduler,
        })
    }

    pub fn stop_watch(&self, handle: WatchHandle) {
        handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::ErrorCategory;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        src: PathBuf,
        dst: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        Fixture { temp_dir, src, dst }
    }

    fn service(f: &Fixture, window: Duration) -> BackupService {
        let pair = BackupPair::builder()
            .source(f.src.clone())
            .destination(f.dst.clone())
            .build();
        let config = BackupConfig::builder()
            .directories(vec![pair])
            .metadata_file(f.temp_dir.path().join("backup_metadata.json"))
            .monitoring_file(f.temp_dir.path().join("monitoring_list.json"))
            .quiescence_window(window)
            .watch_retry_interval(Duration::from_millis(50))
            .build();
        BackupService::new(config).unwrap()
    }

    #[test]
    fn test_create_backup_adds_source_to_watch_set() {
        let f = fixture();
        std::fs::write(f.src.join("a.txt"), "X").unwrap();
        let service = service(&f, Duration::from_secs(300));

        let record = service.create_backup(&f.src, &f.dst, None).unwrap();
        assert!(record.last_archive_path().starts_with(&f.dst));
        assert!(service.watch_set().unwrap().contains(&f.src));
        assert_eq!(service.history(&f.src).unwrap().unwrap(), record);
    }

    #[test]
    fn test_trailing_slash_source_finds_its_history() {
        let f = fixture();
        std::fs::write(f.src.join("a.txt"), "X").unwrap();
        let service = service(&f, Duration::from_secs(300));
        let slashed = PathBuf::from(format!("{}/", f.src.display()));

        let record = service.create_backup(&slashed, &f.dst, None).unwrap();
        assert_eq!(service.history(&f.src).unwrap().unwrap(), record);
        assert_eq!(service.history(&slashed).unwrap().unwrap(), record);

        let out = f.temp_dir.path().join("out");
        service.restore_snapshot(&slashed, &out, None).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "X");
    }

    #[test]
    fn test_watch_defaults_to_every_configured_source() {
        let f = fixture();
        let service = service(&f, Duration::from_secs(300));
        assert_eq!(service.default_watch_directories().unwrap(), vec![f.src.clone()]);
    }

    #[test]
    fn test_start_watch_rejects_unconfigured_directory() {
        let f = fixture();
        let service = service(&f, Duration::from_secs(300));
        let err = service.start_watch([f.temp_dir.path()]).err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_restore_snapshot_without_history_is_not_found() {
        let f = fixture();
        let service = service(&f, Duration::from_secs(300));
        let err = service
            .restore_snapshot(&f.src, f.temp_dir.path().join("out"), None)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_change_under_watch_triggers_backup() {
        let f = fixture();
        let service = service(&f, Duration::from_millis(200));
        let handle = service.start_watch([&f.src]).unwrap();
        assert_eq!(handle.directories(), &[f.src.clone()]);

        std::fs::write(f.src.join("a.txt"), "X").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while service.history(&f.src).unwrap().is_none() {
            assert!(Instant::now() < deadline, "no backup after change");
            std::thread::sleep(Duration::from_millis(50));
        }
        service.stop_watch(handle);

        let record = service.history(&f.src).unwrap().unwrap();
        assert!(record.file_records().contains_key("a.txt"));
    }
}
