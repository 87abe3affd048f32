//! Filesystem change notification for the watched source directories.
//!
//! `DirectoryWatcher::watch` turns `notify` callbacks into a channel of [`ChangeEvent`]s tagged
//! with the watched directory they belong to. Directories that do not exist yet (or disappear
//! later) are retried on an interval instead of failing the whole watch.

use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use chrono::{DateTime, Utc};
use derive_more::Display;
use function_name::named;
use itertools::Itertools;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    #[display("created")]
    Created,
    #[display("modified")]
    Modified,
    #[display("deleted")]
    Deleted,
    #[display("moved")]
    Moved,
}

/// One filesystem change below a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The watched directory the change belongs to, as it was passed to `watch`
    pub directory: PathBuf,
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

/// Watched directory as requested plus the canonical form some backends report paths in.
#[derive(Debug, Clone)]
struct Root {
    requested: PathBuf,
    canonical: PathBuf,
}

struct WatchState {
    watcher: Option<RecommendedWatcher>,
    attached: BTreeSet<PathBuf>,
    pending: BTreeSet<PathBuf>,
}

/// Live watch over a set of directories. Dropping or stopping it ends event delivery.
pub struct DirectoryWatcher {
    state: Arc<Mutex<WatchState>>,
    roots: Arc<RwLock<Vec<Root>>>,
    stop_tx: Option<Sender<()>>,
    retry_thread: Option<JoinHandle<()>>,
}

pub(crate) fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Moved),
        // Permission and timestamp updates leave content untouched.
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) | EventKind::Any => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

/// Watched directory containing `path`; the deepest one wins when roots are nested.
fn root_for<'a>(roots: &'a [Root], path: &Path) -> Option<&'a Root> {
    roots
        .iter()
        .filter(|root| path.starts_with(&root.requested) || path.starts_with(&root.canonical))
        .max_by_key(|root| root.requested.components().count())
}

fn forward(roots: &RwLock<Vec<Root>>, tx: &Sender<ChangeEvent>, event: Event) {
    let Some(kind) = change_kind(&event.kind) else {
        return;
    };
    let roots = roots.read().unwrap_or_else(PoisonError::into_inner);
    for path in event.paths {
        let Some(root) = root_for(&roots, &path) else {
            tracing::trace!("Ignoring event outside watched directories: {:?}", path);
            continue;
        };
        let change = ChangeEvent {
            directory: root.requested.clone(),
            path,
            kind,
            timestamp: Utc::now(),
        };
        tracing::trace!("{} {:?}", change.kind, change.path);
        if tx.send(change).is_err() {
            return;
        }
    }
}

impl DirectoryWatcher {
    /// Starts watching `directories` recursively.
    ///
    /// Missing directories are retried every `retry_interval`. The returned receiver yields events
    /// until the watcher is stopped or dropped.
    #[named]
    pub fn watch<I, P>(directories: I, retry_interval: Duration) -> Result<(Self, Receiver<ChangeEvent>)>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let directories = directories.into_iter().map(Into::into).collect::<BTreeSet<PathBuf>>();
        let (tx, rx) = channel();
        let roots = Arc::new(RwLock::new(Vec::<Root>::new()));

        let callback_roots = roots.clone();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => forward(&callback_roots, &tx, event),
                Err(e) => tracing::warn!("Filesystem watch error: {e}"),
            },
            Config::default(),
        )
        .map_err(Error::from)
        .with_debug_object_and_fn_name(directories.clone(), function_path!())?;

        let state = Arc::new(Mutex::new(WatchState {
            watcher: Some(watcher),
            attached: BTreeSet::new(),
            pending: directories,
        }));
        attach_pending(&state, &roots);

        let (stop_tx, stop_rx) = channel::<()>();
        let retry_state = state.clone();
        let retry_roots = roots.clone();
        let retry_thread = std::thread::Builder::new()
            .name("watch-retry".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(retry_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        detach_vanished(&retry_state, &retry_roots);
                        attach_pending(&retry_state, &retry_roots);
                    }
                    _ => break,
                }
            })?;

        Ok((
            Self {
                state,
                roots,
                stop_tx: Some(stop_tx),
                retry_thread: Some(retry_thread),
            },
            rx,
        ))
    }

    pub fn attached(&self) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.attached.iter().cloned().collect_vec()
    }

    /// Directories waiting to exist.
    pub fn pending(&self) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.iter().cloned().collect_vec()
    }

    /// Stops event delivery and releases every watch handle.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.retry_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Watch retry thread panicked");
            }
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut watcher) = state.watcher.take() {
            for dir in std::mem::take(&mut state.attached) {
                if let Err(e) = watcher.unwatch(&dir) {
                    tracing::debug!("Unwatch {:?} failed: {e}", dir);
                }
                tracing::info!(directory = ?dir, "Stopped watching");
            }
            state.pending.clear();
        }
        self.roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn attach_pending(state: &Mutex<WatchState>, roots: &RwLock<Vec<Root>>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let WatchState {
        watcher,
        attached,
        pending,
    } = &mut *state;
    let Some(watcher) = watcher.as_mut() else {
        return;
    };

    let mut newly_attached = Vec::new();
    for dir in pending.iter() {
        if !dir.is_dir() {
            tracing::debug!("{:?} does not exist yet, will retry", dir);
            continue;
        }
        match watcher.watch(dir, RecursiveMode::Recursive) {
            Ok(()) => {
                tracing::info!(directory = ?dir, "Watching");
                newly_attached.push(Root {
                    requested: dir.clone(),
                    canonical: dir.canonicalize().unwrap_or_else(|_| dir.clone()),
                });
            }
            Err(e) => tracing::warn!(directory = ?dir, "Watch failed, will retry: {e}"),
        }
    }

    for root in &newly_attached {
        pending.remove(&root.requested);
        attached.insert(root.requested.clone());
    }
    if !newly_attached.is_empty() {
        roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(newly_attached);
    }
}

/// Moves directories that disappeared since they were attached back to pending.
fn detach_vanished(state: &Mutex<WatchState>, roots: &RwLock<Vec<Root>>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let WatchState {
        watcher,
        attached,
        pending,
    } = &mut *state;
    let Some(watcher) = watcher.as_mut() else {
        return;
    };

    let vanished = attached.iter().filter(|dir| !dir.is_dir()).cloned().collect_vec();
    for dir in &vanished {
        tracing::warn!(directory = ?dir, "Watched directory disappeared, will retry");
        // The backend usually dropped the watch already.
        let _ = watcher.unwatch(dir);
        attached.remove(dir);
        pending.insert(dir.clone());
    }
    if !vanished.is_empty() {
        roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|root| !vanished.contains(&root.requested));
    }
}
