//! Change tracking for session files.
//!
//! One non-recursive watcher per `chats` directory marks session files dirty,
//! and a watcher on the storage root picks up newly created project
//! directories. Notifications can be dropped or coalesced, so a timer also
//! raises a force-full flag that makes the next reconciliation pass stat
//! every file.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace};

use crate::paths::{chats_dirs, is_session_file_in, probe_chats_dir};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watches `dir` non-recursively, forwarding session-file paths that changed.
pub(crate) fn watch_session_files<F>(dir: &Path, mut on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: FnMut(PathBuf) + Send + 'static,
{
    let chats_dir = dir.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for path in event.paths {
                if is_session_file_in(&chats_dir, &path) {
                    on_change(path);
                }
            }
        }
        Err(err) => debug!(error = %err, "chats watcher error"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Watches the storage root and reports the `chats` directory of every
/// project directory that appears under it.
pub(crate) fn watch_new_projects<F>(root: &Path, mut on_chats_dir: F) -> notify::Result<RecommendedWatcher>
where
    F: FnMut(PathBuf) + Send + 'static,
{
    let root_dir = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
            ) {
                return;
            }
            for path in event.paths {
                if path.parent() != Some(root_dir.as_path()) {
                    continue;
                }
                if let Some(chats) = probe_chats_dir(&path) {
                    on_chats_dir(chats);
                }
            }
        }
        Err(err) => debug!(error = %err, "root watcher error"),
    })?;
    watcher.watch(root, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[derive(Default)]
struct WatchShared {
    dirty: Mutex<HashSet<PathBuf>>,
    force_full: AtomicBool,
    chats_watchers: Mutex<HashMap<PathBuf, RecommendedWatcher>>,
}

impl WatchShared {
    fn mark_dirty(&self, path: PathBuf) {
        lock(&self.dirty).insert(path);
    }
}

fn attach_chats_watcher(shared: &Arc<WatchShared>, chats_dir: &Path) {
    let mut watchers = lock(&shared.chats_watchers);
    if watchers.contains_key(chats_dir) {
        return;
    }

    let weak: Weak<WatchShared> = Arc::downgrade(shared);
    let result = watch_session_files(chats_dir, move |path| {
        if let Some(shared) = weak.upgrade() {
            trace!(path = %path.display(), "session file dirty");
            shared.mark_dirty(path);
        }
    });
    match result {
        Ok(watcher) => {
            watchers.insert(chats_dir.to_path_buf(), watcher);
        }
        Err(err) => {
            debug!(dir = %chats_dir.display(), error = %err, "chats watch unavailable; relying on reconciliation");
        }
    }
}

struct ReconciliationTimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReconciliationTimer {
    fn spawn(interval: Duration, shared: Weak<WatchShared>) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("reconcile-timer".to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    shared.force_full.store(true, Ordering::Release);
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for ReconciliationTimer {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Dirty-path tracking plus the periodic full-reconciliation trigger.
pub struct SessionWatcher {
    root: PathBuf,
    interval: Duration,
    shared: Arc<WatchShared>,
    root_watcher: Option<RecommendedWatcher>,
    timer: Option<ReconciliationTimer>,
    started: bool,
}

impl SessionWatcher {
    pub fn new(root: PathBuf, interval: Duration) -> Self {
        Self {
            root,
            interval,
            shared: Arc::new(WatchShared::default()),
            root_watcher: None,
            timer: None,
            started: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Attaches the root and chats watchers and arms the reconciliation timer.
    /// Calling it again while started does nothing.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let weak = Arc::downgrade(&self.shared);
        match watch_new_projects(&self.root, move |chats_dir| {
            if let Some(shared) = weak.upgrade() {
                attach_chats_watcher(&shared, &chats_dir);
            }
        }) {
            Ok(watcher) => self.root_watcher = Some(watcher),
            Err(err) => debug!(root = %self.root.display(), error = %err, "root watch unavailable"),
        }

        for chats_dir in chats_dirs(&self.root) {
            attach_chats_watcher(&self.shared, &chats_dir);
        }

        match ReconciliationTimer::spawn(self.interval, Arc::downgrade(&self.shared)) {
            Ok(timer) => self.timer = Some(timer),
            Err(err) => debug!(error = %err, "failed to spawn reconciliation timer"),
        }
    }

    /// Releases the timer and every watcher; dirty paths are discarded.
    pub fn stop(&mut self) {
        self.timer = None;
        self.root_watcher = None;
        let watchers = mem::take(&mut *lock(&self.shared.chats_watchers));
        drop(watchers);
        lock(&self.shared.dirty).clear();
        self.started = false;
    }

    /// Idempotent: a directory already being watched is left alone.
    pub fn watch_chats_dir(&self, chats_dir: &Path) {
        attach_chats_watcher(&self.shared, chats_dir);
    }

    pub fn is_watching(&self, chats_dir: &Path) -> bool {
        lock(&self.shared.chats_watchers).contains_key(chats_dir)
    }

    pub fn watched_dir_count(&self) -> usize {
        lock(&self.shared.chats_watchers).len()
    }

    pub fn mark_dirty(&self, path: PathBuf) {
        self.shared.mark_dirty(path);
    }

    /// Takes every dirty path recorded since the previous drain.
    pub fn drain_dirty(&self) -> HashSet<PathBuf> {
        mem::take(&mut *lock(&self.shared.dirty))
    }

    pub fn request_full_reconciliation(&self) {
        self.shared.force_full.store(true, Ordering::Release);
    }

    /// Reads and clears the force-full flag.
    pub fn take_force_full(&self) -> bool {
        self.shared.force_full.swap(false, Ordering::AcqRel)
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
