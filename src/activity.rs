//! Live tail of session files: every token-bearing message is reported once,
//! after a baseline of the messages already on disk has been recorded.

use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use notify::RecommendedWatcher;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::paths::{chats_dirs, read_session_files};
use crate::record::{TokenBearing, load_record};
use crate::usage::non_zero;
use crate::util::{now_ms, to_timestamp};
use crate::watcher::{lock, watch_new_projects, watch_session_files};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTokens {
    pub input: u64,
    pub output: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityUpdate {
    pub session_id: String,
    pub message_id: String,
    pub tokens: ActivityTokens,
    pub timestamp: i64,
}

impl ActivityUpdate {
    fn from_message(session_id: &str, message: &TokenBearing<'_>, now_ms: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: message.id.to_string(),
            tokens: ActivityTokens {
                input: message.tokens.input,
                output: message.tokens.output,
                cache_read: non_zero(message.tokens.cached),
                reasoning: message.tokens.thoughts.and_then(non_zero),
            },
            timestamp: to_timestamp(message.timestamp, now_ms),
        }
    }
}

pub type ActivityCallback = Arc<dyn Fn(&ActivityUpdate) + Send + Sync>;

#[derive(Default)]
struct ActivityShared {
    callback: Mutex<Option<ActivityCallback>>,
    seen: Mutex<HashMap<PathBuf, HashSet<String>>>,
    watchers: Mutex<HashMap<PathBuf, RecommendedWatcher>>,
    primers: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivityShared {
    fn attach(self: &Arc<Self>, chats_dir: &Path) {
        let mut watchers = lock(&self.watchers);
        if watchers.contains_key(chats_dir) {
            return;
        }

        let weak: Weak<ActivityShared> = Arc::downgrade(self);
        match watch_session_files(chats_dir, move |path| {
            if let Some(shared) = weak.upgrade() {
                shared.process_change(&path);
            }
        }) {
            Ok(watcher) => {
                watchers.insert(chats_dir.to_path_buf(), watcher);
            }
            Err(err) => {
                debug!(dir = %chats_dir.display(), error = %err, "activity watch unavailable");
            }
        }
    }

    /// Records the ids already present in `chats_dir` without reporting them.
    fn prime(&self, chats_dir: &Path) -> io::Result<usize> {
        let mut primed = 0;
        for path in read_session_files(chats_dir)? {
            let Some(record) = load_record(&path) else {
                continue;
            };
            let ids: Vec<String> = record
                .token_bearing_messages()
                .map(|message| message.id.to_string())
                .collect();
            lock(&self.seen).entry(path).or_default().extend(ids);
            primed += 1;
        }
        Ok(primed)
    }

    fn spawn_primer(self: &Arc<Self>, chats_dirs: Vec<PathBuf>) {
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("activity-primer".to_string())
            .spawn(move || {
                for chats_dir in chats_dirs {
                    match shared.prime(&chats_dir) {
                        Ok(files) => trace!(dir = %chats_dir.display(), files, "primed activity baseline"),
                        Err(err) => debug!(dir = %chats_dir.display(), error = %err, "failed to prime activity baseline"),
                    }
                }
            });
        match spawned {
            Ok(handle) => lock(&self.primers).push(handle),
            Err(err) => debug!(error = %err, "failed to spawn activity primer"),
        }
    }

    fn process_change(&self, path: &Path) {
        let Some(callback) = lock(&self.callback).clone() else {
            return;
        };
        let Some(record) = load_record(path) else {
            return;
        };

        let now = now_ms();
        let updates: Vec<ActivityUpdate> = {
            let mut seen = lock(&self.seen);
            let ids = seen.entry(path.to_path_buf()).or_default();
            record
                .token_bearing_messages()
                .filter(|message| ids.insert(message.id.to_string()))
                .map(|message| ActivityUpdate::from_message(&record.session_id, &message, now))
                .collect()
        };

        for update in &updates {
            callback(update);
        }
    }

    fn join_primers(&self) {
        let primers = mem::take(&mut *lock(&self.primers));
        for handle in primers {
            let _ = handle.join();
        }
    }
}

/// Reports each newly appended token-bearing message exactly once.
pub struct ActivityWatcher {
    root: PathBuf,
    shared: Arc<ActivityShared>,
    root_watcher: Option<RecommendedWatcher>,
    started: bool,
}

impl ActivityWatcher {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            shared: Arc::new(ActivityShared::default()),
            root_watcher: None,
            started: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Registers `callback`; the first call also attaches watchers and primes
    /// baselines in the background. Later calls only replace the callback.
    pub fn start(&mut self, callback: ActivityCallback) {
        *lock(&self.shared.callback) = Some(callback);
        if self.started {
            return;
        }
        self.started = true;

        let weak = Arc::downgrade(&self.shared);
        match watch_new_projects(&self.root, move |chats_dir| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.attach(&chats_dir);
            if let Err(err) = shared.prime(&chats_dir) {
                debug!(dir = %chats_dir.display(), error = %err, "failed to prime new project");
            }
        }) {
            Ok(watcher) => self.root_watcher = Some(watcher),
            Err(err) => debug!(root = %self.root.display(), error = %err, "activity root watch unavailable"),
        }

        let dirs = chats_dirs(&self.root);
        for chats_dir in &dirs {
            self.shared.attach(chats_dir);
        }
        self.shared.spawn_primer(dirs);
    }

    /// Blocks until background baseline priming has finished.
    pub fn wait_until_primed(&self) {
        self.shared.join_primers();
    }

    /// Handles a change to `path` the same way a watcher notification does.
    pub fn notify_changed(&self, path: &Path) {
        self.shared.process_change(path);
    }

    pub fn watched_dir_count(&self) -> usize {
        lock(&self.shared.watchers).len()
    }

    pub fn seen_message_count(&self, path: &Path) -> usize {
        lock(&self.shared.seen).get(path).map_or(0, HashSet::len)
    }

    /// Closes every watcher and forgets baselines and the callback.
    pub fn stop(&mut self) {
        *lock(&self.shared.callback) = None;
        self.root_watcher = None;
        let watchers = mem::take(&mut *lock(&self.shared.watchers));
        drop(watchers);
        self.shared.join_primers();
        lock(&self.shared.seen).clear();
        self.started = false;
    }
}

impl Drop for ActivityWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
