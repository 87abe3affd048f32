//! Change-triggered backup scheduling.
//!
//! Every watched directory has its own resettable deadline. Each change pushes the deadline to
//! `now + quiescence_window`; when a deadline passes without further changes the directory is
//! backed up once. Changes arriving while that run executes re-arm the directory so exactly one
//! follow-up run starts after the active one finishes.

use crate::backup::backup_config::BackupPair;
use crate::backup::engine::BackupEngine;
use crate::backup::metadata::BackupRecord;
use crate::backup::result_error::result::Result;
use crate::backup::watcher::ChangeEvent;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Executes one backup job. Implemented by [`BackupEngine`]; tests substitute their own.
pub trait BackupRunner: Send + Sync + 'static {
    fn run_backup(&self, job: &BackupPair) -> Result<BackupRecord>;
}

impl BackupRunner for BackupEngine {
    fn run_backup(&self, job: &BackupPair) -> Result<BackupRecord> {
        let (record, non_fatal) = self.run(job)?;
        if let Some(e) = non_fatal {
            tracing::warn!(
                source = ?job.source,
                category = %e.category(),
                "Backup finished with skipped files:\n{e}"
            );
        }
        Ok(record)
    }
}

#[derive(Debug)]
enum Signal {
    Change(ChangeEvent),
    Finished { directory: PathBuf },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    Idle,
    Pending(Instant),
    /// A run is executing; `rearm` is the deadline for the follow-up run, if any change arrived.
    Running { rearm: Option<Instant> },
}

impl DirState {
    fn on_change(self, now: Instant, window: Duration) -> DirState {
        match self {
            DirState::Idle | DirState::Pending(_) => DirState::Pending(now + window),
            DirState::Running { .. } => DirState::Running {
                rearm: Some(now + window),
            },
        }
    }

    fn on_finished(self, now: Instant) -> DirState {
        match self {
            DirState::Running {
                rearm: Some(deadline),
            } => DirState::Pending(deadline.max(now)),
            DirState::Running { rearm: None } => DirState::Idle,
            other => other,
        }
    }
}

struct Slot {
    job: BackupPair,
    state: DirState,
}

/// Sends `Finished` even when the runner panics, so the directory never stays stuck in `Running`.
struct FinishGuard {
    tx: Sender<Signal>,
    directory: PathBuf,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Signal::Finished {
            directory: std::mem::take(&mut self.directory),
        });
    }
}

struct SchedulerLoop<R: BackupRunner> {
    slots: HashMap<PathBuf, Slot>,
    window: Duration,
    runner: Arc<R>,
    tx: Sender<Signal>,
    runs: Vec<JoinHandle<()>>,
}

impl<R: BackupRunner> SchedulerLoop<R> {
    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| match slot.state {
                DirState::Pending(deadline) => Some(deadline),
                _ => None,
            })
            .min()
    }

    fn on_change(&mut self, event: ChangeEvent, now: Instant) {
        let Some(slot) = self.slots.get_mut(&event.directory) else {
            tracing::trace!("Ignoring change in unscheduled directory {:?}", event.directory);
            return;
        };
        if event.path.starts_with(&slot.job.destination) {
            tracing::trace!("Ignoring change inside destination: {:?}", event.path);
            return;
        }
        tracing::debug!(
            directory = ?event.directory,
            "{} {:?}, backup in {:?} unless more changes arrive",
            event.kind,
            event.path,
            self.window
        );
        slot.state = slot.state.on_change(now, self.window);
    }

    fn on_finished(&mut self, directory: PathBuf, now: Instant) {
        if let Some(slot) = self.slots.get_mut(&directory) {
            slot.state = slot.state.on_finished(now);
            if let DirState::Pending(_) = slot.state {
                tracing::debug!(directory = ?directory, "Changes arrived during the run, re-armed");
            }
        }
    }

    fn fire_due(&mut self, now: Instant) {
        let due = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.state, DirState::Pending(deadline) if deadline <= now))
            .map(|(directory, _)| directory.clone())
            .collect::<Vec<_>>();
        for directory in due {
            self.start_run(&directory, now);
        }
    }

    fn start_run(&mut self, directory: &Path, now: Instant) {
        let Some(slot) = self.slots.get_mut(directory) else {
            return;
        };
        let job = slot.job.clone();
        let runner = self.runner.clone();
        let guard = FinishGuard {
            tx: self.tx.clone(),
            directory: directory.to_path_buf(),
        };
        let spawned = std::thread::Builder::new()
            .name("backup-run".to_string())
            .spawn(move || {
                let _guard = guard;
                tracing::info!(source = ?job.source, "Directory quiet, starting backup");
                match runner.run_backup(&job) {
                    Ok(record) => tracing::info!(
                        source = ?job.source,
                        archive = ?record.last_archive_path(),
                        "Scheduled backup finished"
                    ),
                    Err(e) => tracing::error!(
                        source = ?job.source,
                        category = %e.category(),
                        "Scheduled backup failed:\n{e}"
                    ),
                }
            });
        match spawned {
            Ok(handle) => {
                slot.state = DirState::Running { rearm: None };
                self.runs.push(handle);
            }
            Err(e) => {
                tracing::error!(directory = ?directory, "Cannot start backup thread, retrying later: {e}");
                slot.state = DirState::Pending(now + self.window);
            }
        }
    }

    fn run(mut self, rx: Receiver<Signal>) {
        loop {
            self.fire_due(Instant::now());
            self.runs.retain(|handle| !handle.is_finished());

            let signal = match self.next_deadline() {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match signal {
                Ok(Signal::Change(event)) => self.on_change(event, Instant::now()),
                Ok(Signal::Finished { directory }) => self.on_finished(directory, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let pending = self
            .slots
            .values()
            .filter(|slot| matches!(slot.state, DirState::Pending(_)))
            .count();
        if pending > 0 {
            tracing::info!("Dropping {pending} pending backup(s) on shutdown");
        }
        for handle in self.runs.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Backup run thread panicked");
            }
        }
    }
}

/// Owns the scheduling thread. Stop it with [`DebounceScheduler::shutdown`].
pub struct DebounceScheduler {
    tx: Sender<Signal>,
    loop_thread: Option<JoinHandle<()>>,
}

impl DebounceScheduler {
    /// Starts scheduling `jobs`, consuming `events` until the sending side closes or the scheduler
    /// shuts down.
    pub fn spawn<R: BackupRunner>(
        jobs: Vec<BackupPair>,
        window: Duration,
        runner: Arc<R>,
        events: Receiver<ChangeEvent>,
    ) -> Result<Self> {
        let (tx, rx) = channel();
        let slots = jobs
            .into_iter()
            .map(|job| {
                (
                    job.source.clone(),
                    Slot {
                        job,
                        state: DirState::Idle,
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        tracing::info!(
            directories = slots.len(),
            "Scheduling backups after {:?} of quiet",
            window
        );

        let scheduler_loop = SchedulerLoop {
            slots,
            window,
            runner,
            tx: tx.clone(),
            runs: Vec::new(),
        };
        let loop_thread = std::thread::Builder::new()
            .name("debounce".to_string())
            .spawn(move || scheduler_loop.run(rx))?;

        // Ends on its own once the event source closes.
        let forward_tx = tx.clone();
        std::thread::Builder::new()
            .name("debounce-events".to_string())
            .spawn(move || {
                for event in events {
                    if forward_tx.send(Signal::Change(event)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            tx,
            loop_thread: Some(loop_thread),
        })
    }

    /// Drops pending deadlines and waits for in-flight runs to complete.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.loop_thread.take() else {
            return;
        };
        let _ = self.tx.send(Signal::Shutdown);
        if handle.join().is_err() {
            tracing::error!("Debounce scheduler thread panicked");
        }
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::Error;
    use crate::backup::watcher::ChangeKind;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRunner {
        delay: Duration,
        fail: bool,
        started: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        runs: Mutex<Vec<(PathBuf, Instant, Instant)>>,
    }

    impl FakeRunner {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn finished(&self) -> Vec<(PathBuf, Instant, Instant)> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl BackupRunner for FakeRunner {
        fn run_backup(&self, job: &BackupPair) -> Result<BackupRecord> {
            let start = Instant::now();
            self.started.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs
                .lock()
                .unwrap()
                .push((job.source.clone(), start, Instant::now()));
            if self.fail {
                return Err(Error::NotFound(job.source.clone()));
            }
            Ok(BackupRecord::builder()
                .source_directory(job.source.clone())
                .last_archive_path(job.destination.join("x.zip"))
                .archive_size_bytes(0)
                .last_run_timestamp("t")
                .build())
        }
    }

    fn pair(name: &str) -> BackupPair {
        BackupPair::builder()
            .source(format!("/watched/{name}"))
            .destination(format!("/backups/{name}"))
            .build()
    }

    fn change(job: &BackupPair, file: &str) -> ChangeEvent {
        ChangeEvent {
            directory: job.source.clone(),
            path: job.source.join(file),
            kind: ChangeKind::Modified,
            timestamp: Utc::now(),
        }
    }

    fn wait_until<F: Fn() -> bool>(f: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    #[test]
    fn test_state_transitions() {
        let now = Instant::now();
        let window = Duration::from_secs(300);
        let later = now + Duration::from_secs(10);

        assert_eq!(DirState::Idle.on_change(now, window), DirState::Pending(now + window));
        assert_eq!(
            DirState::Pending(now + window).on_change(later, window),
            DirState::Pending(later + window)
        );
        assert_eq!(
            DirState::Running { rearm: None }.on_change(now, window),
            DirState::Running {
                rearm: Some(now + window)
            }
        );
        assert_eq!(DirState::Running { rearm: None }.on_finished(now), DirState::Idle);
        assert_eq!(
            DirState::Running {
                rearm: Some(now + window)
            }
            .on_finished(later),
            DirState::Pending(now + window)
        );
        // A follow-up whose window already elapsed during the run fires right away.
        assert_eq!(
            DirState::Running { rearm: Some(now) }.on_finished(later),
            DirState::Pending(later)
        );
    }

    #[test]
    fn test_burst_of_changes_triggers_one_run_after_quiet_window() {
        let window = Duration::from_millis(200);
        let runner = Arc::new(FakeRunner::default());
        let job = pair("docs");
        let (tx, rx) = channel();
        let scheduler =
            DebounceScheduler::spawn(vec![job.clone()], window, runner.clone(), rx).unwrap();

        let mut last_event = Instant::now();
        for i in 0..5 {
            last_event = Instant::now();
            tx.send(change(&job, &format!("f{i}.txt"))).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(wait_until(|| runner.finished().len() == 1));
        let (source, start, _) = runner.finished()[0].clone();
        assert_eq!(source, job.source);
        assert!(start >= last_event + window);

        std::thread::sleep(window * 2);
        assert_eq!(runner.finished().len(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_directories_are_debounced_independently() {
        let window = Duration::from_millis(100);
        let runner = Arc::new(FakeRunner::default());
        let docs = pair("docs");
        let photos = pair("photos");
        let (tx, rx) = channel();
        let scheduler = DebounceScheduler::spawn(
            vec![docs.clone(), photos.clone()],
            window,
            runner.clone(),
            rx,
        )
        .unwrap();

        tx.send(change(&docs, "a.txt")).unwrap();
        // Continuous churn in photos must not hold back docs.
        for i in 0..6 {
            tx.send(change(&photos, &format!("{i}.jpg"))).unwrap();
            std::thread::sleep(Duration::from_millis(40));
        }
        let docs_runs = runner
            .finished()
            .iter()
            .filter(|(source, _, _)| *source == docs.source)
            .count();
        assert_eq!(docs_runs, 1);

        assert!(wait_until(|| runner.finished().len() == 2));
        scheduler.shutdown();
    }

    #[test]
    fn test_change_during_run_schedules_exactly_one_follow_up() {
        let window = Duration::from_millis(50);
        let runner = Arc::new(FakeRunner::with_delay(Duration::from_millis(300)));
        let job = pair("docs");
        let (tx, rx) = channel();
        let scheduler =
            DebounceScheduler::spawn(vec![job.clone()], window, runner.clone(), rx).unwrap();

        tx.send(change(&job, "a.txt")).unwrap();
        assert!(wait_until(|| runner.started.load(Ordering::SeqCst) == 1));
        for i in 0..3 {
            tx.send(change(&job, &format!("b{i}.txt"))).unwrap();
        }

        assert!(wait_until(|| runner.finished().len() == 2));
        std::thread::sleep(Duration::from_millis(200));
        let runs = runner.finished();
        assert_eq!(runs.len(), 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert!(runs[1].1 >= runs[0].2);
        scheduler.shutdown();
    }

    #[test]
    fn test_changes_inside_destination_and_unknown_directories_ignored() {
        let window = Duration::from_millis(50);
        let runner = Arc::new(FakeRunner::default());
        let mut job = pair("docs");
        job.destination = job.source.join(".backups");
        let (tx, rx) = channel();
        let scheduler =
            DebounceScheduler::spawn(vec![job.clone()], window, runner.clone(), rx).unwrap();

        tx.send(change(&job, ".backups/backup_1.zip")).unwrap();
        tx.send(change(&pair("other"), "a.txt")).unwrap();
        std::thread::sleep(window * 6);
        assert!(runner.finished().is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn test_failed_run_returns_directory_to_idle() {
        let window = Duration::from_millis(50);
        let runner = Arc::new(FakeRunner {
            fail: true,
            ..Default::default()
        });
        let job = pair("docs");
        let (tx, rx) = channel();
        let scheduler =
            DebounceScheduler::spawn(vec![job.clone()], window, runner.clone(), rx).unwrap();

        tx.send(change(&job, "a.txt")).unwrap();
        assert!(wait_until(|| runner.finished().len() == 1));
        tx.send(change(&job, "a.txt")).unwrap();
        assert!(wait_until(|| runner.finished().len() == 2));
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_waits_for_active_run() {
        let window = Duration::from_millis(20);
        let runner = Arc::new(FakeRunner::with_delay(Duration::from_millis(300)));
        let job = pair("docs");
        let (tx, rx) = channel();
        let scheduler =
            DebounceScheduler::spawn(vec![job.clone()], window, runner.clone(), rx).unwrap();

        tx.send(change(&job, "a.txt")).unwrap();
        assert!(wait_until(|| runner.started.load(Ordering::SeqCst) == 1));
        scheduler.shutdown();
        assert_eq!(runner.finished().len(), 1);
        assert_eq!(runner.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drops_pending_deadlines() {
        let runner = Arc::new(FakeRunner::default());
        let job = pair("docs");
        let (tx, rx) = channel();
        let scheduler =
            DebounceScheduler::spawn(vec![job.clone()], Duration::from_secs(60), runner.clone(), rx)
                .unwrap();

        tx.send(change(&job, "a.txt")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        scheduler.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(runner.started.load(Ordering::SeqCst), 0);
    }
}
