use std::cmp::Reverse;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::activity::{ActivityUpdate, ActivityWatcher};
use crate::cache::{AggregateCache, AggregateEntry, MetadataEntry, MetadataIndex, ResultCache};
use crate::config::{self, EngineSettings};
use crate::paths::{chats_dirs, list_session_files};
use crate::record::load_record;
use crate::usage::{UsageRow, extract_usage_rows};
use crate::util::{now_ms, system_time_ms};
use crate::watcher::SessionWatcher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionQuery {
    /// Part of the result-cache key; rows are not truncated here.
    pub limit: Option<usize>,
    /// Only sessions whose file changed at or after this epoch ms.
    pub since: Option<i64>,
    pub session_id: Option<String>,
}

impl SessionQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn since(mut self, since_ms: i64) -> Self {
        self.since = Some(since_ms);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Counters for the most recent [`UsageEngine::query`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub served_from_cache: bool,
    pub forced_full: bool,
    pub rows: usize,
    pub session_files: usize,
    pub stat_checks: usize,
    pub stat_skips: usize,
    pub dirty_hits: usize,
    pub file_reads: usize,
    pub aggregate_hits: usize,
    pub aggregate_misses: usize,
    pub evicted_metadata: usize,
    pub evicted_aggregates: usize,
}

#[derive(Debug, Clone)]
struct SessionFile {
    session_id: String,
    path: PathBuf,
    modified_at_ms: i64,
}

impl SessionFile {
    fn matches(&self, session_id: Option<&str>, since: Option<i64>) -> bool {
        session_id.is_none_or(|wanted| self.session_id == wanted)
            && since.is_none_or(|since| self.modified_at_ms >= since)
    }
}

/// Incremental usage scanner over the session store.
///
/// Owns every cache and watcher; nothing is process-global, so independent
/// engines never observe each other's state.
pub struct UsageEngine {
    settings: EngineSettings,
    root: PathBuf,
    metadata: MetadataIndex,
    aggregates: AggregateCache,
    results: ResultCache,
    watcher: SessionWatcher,
    activity: ActivityWatcher,
    last_stats: PassStats,
}

impl UsageEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let root = settings.tmp_path();
        Self {
            metadata: MetadataIndex::default(),
            aggregates: AggregateCache::new(settings.aggregate_cache_capacity),
            results: ResultCache::new(settings.result_cache_ttl),
            watcher: SessionWatcher::new(root.clone(), settings.reconciliation_interval),
            activity: ActivityWatcher::new(root.clone()),
            last_stats: PassStats::default(),
            root,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn storage_root(&self) -> &Path {
        &self.root
    }

    pub fn is_installed(&self) -> bool {
        config::is_installed(&self.settings.gemini_home)
    }

    pub fn last_pass_stats(&self) -> &PassStats {
        &self.last_stats
    }

    pub fn metadata(&self) -> &MetadataIndex {
        &self.metadata
    }

    pub fn session_watcher(&self) -> &SessionWatcher {
        &self.watcher
    }

    pub fn activity(&self) -> &ActivityWatcher {
        &self.activity
    }

    /// Makes the next pass stat every file, as the periodic timer does.
    pub fn request_full_reconciliation(&self) {
        self.watcher.request_full_reconciliation();
    }

    /// Usage rows for the matching sessions, most recently modified file first.
    ///
    /// Unreadable, vanished or malformed files contribute no rows; this never fails.
    pub fn query(&mut self, query: &SessionQuery) -> Arc<Vec<UsageRow>> {
        if !self.root.exists() {
            debug!(root = %self.root.display(), "no Gemini CLI tmp directory found");
            self.last_stats = PassStats::default();
            return Arc::new(Vec::new());
        }

        self.watcher.start();

        let limit = query.limit.unwrap_or(self.settings.default_limit);
        let since = query.since;
        let session_filter = query.session_id.as_deref();

        if session_filter.is_none()
            && let Some(cached) = self.results.lookup(limit, since)
        {
            debug!(count = cached.len(), "using cached sessions (within TTL)");
            self.last_stats = PassStats {
                served_from_cache: true,
                rows: cached.len(),
                ..PassStats::default()
            };
            return cached;
        }

        let now = now_ms();
        let mut stats = PassStats::default();
        let dirty = self.watcher.drain_dirty();
        let force_full = self.watcher.take_force_full();
        stats.forced_full = force_full;
        if force_full {
            debug!("full reconciliation sweep triggered");
        }

        let mut files: Vec<SessionFile> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for chats_dir in chats_dirs(&self.root) {
            self.watcher.watch_chats_dir(&chats_dir);

            for path in list_session_files(&chats_dir) {
                seen.insert(path.clone());
                let Some(file) = self.resolve_file(path, &dirty, force_full, &mut stats)
                else {
                    continue;
                };
                if file.matches(session_filter, since) {
                    files.push(file);
                }
            }
        }

        stats.evicted_metadata = self.metadata.retain_seen(&seen);
        files.sort_by_key(|file| Reverse(file.modified_at_ms));

        let mut rows: Vec<UsageRow> = Vec::new();
        for file in &files {
            if let Some(cached) =
                self.aggregates
                    .get_fresh(&file.session_id, file.modified_at_ms, now)
            {
                stats.aggregate_hits += 1;
                rows.extend_from_slice(cached);
                continue;
            }

            stats.aggregate_misses += 1;
            stats.file_reads += 1;
            let Some(record) = load_record(&file.path) else {
                continue;
            };
            let usage_rows = extract_usage_rows(&record, file.modified_at_ms);
            rows.extend_from_slice(&usage_rows);
            self.aggregates.set(
                file.session_id.clone(),
                AggregateEntry {
                    updated_at_ms: file.modified_at_ms,
                    usage_rows,
                    last_accessed_ms: now,
                },
            );
        }

        stats.evicted_aggregates = self.aggregates.evict();

        let rows = Arc::new(rows);
        if session_filter.is_none() {
            self.results.store(Arc::clone(&rows), limit, since);
        }

        stats.rows = rows.len();
        stats.session_files = files.len();
        debug!(
            count = stats.rows,
            session_files = stats.session_files,
            stat_checks = stats.stat_checks,
            stat_skips = stats.stat_skips,
            dirty_hits = stats.dirty_hits,
            aggregate_hits = stats.aggregate_hits,
            aggregate_misses = stats.aggregate_misses,
            metadata_index_size = self.metadata.len(),
            aggregate_cache_size = self.aggregates.len(),
            "parsed sessions"
        );
        self.last_stats = stats;
        rows
    }

    /// Current identity of one enumerated session file, or `None` when it is
    /// gone or unusable (its index entry is dropped in that case).
    fn resolve_file(
        &mut self,
        path: PathBuf,
        dirty: &HashSet<PathBuf>,
        force_full: bool,
        stats: &mut PassStats,
    ) -> Option<SessionFile> {
        let is_dirty = dirty.contains(&path);
        if is_dirty {
            stats.dirty_hits += 1;
        }
        let known = self.metadata.get(&path).cloned();

        if !is_dirty
            && !force_full
            && let Some(entry) = &known
        {
            stats.stat_skips += 1;
            return Some(SessionFile {
                session_id: entry.session_id.clone(),
                path,
                modified_at_ms: entry.modified_at_ms,
            });
        }

        stats.stat_checks += 1;
        let modified_at_ms = match fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) => system_time_ms(modified),
            Err(err) => {
                trace!(path = %path.display(), error = %err, "session file vanished");
                self.metadata.delete(&path);
                return None;
            }
        };

        if let Some(entry) = known
            && entry.modified_at_ms == modified_at_ms
        {
            return Some(SessionFile {
                session_id: entry.session_id,
                path,
                modified_at_ms,
            });
        }

        stats.file_reads += 1;
        let Some(record) = load_record(&path) else {
            self.metadata.delete(&path);
            return None;
        };
        self.metadata.set(
            path.clone(),
            MetadataEntry {
                modified_at_ms,
                session_id: record.session_id.clone(),
            },
        );
        Some(SessionFile {
            session_id: record.session_id,
            path,
            modified_at_ms,
        })
    }

    /// Starts reporting new token-bearing messages to `callback`. While already
    /// running only the callback is replaced.
    pub fn start_watch<F>(&mut self, callback: F)
    where
        F: Fn(&ActivityUpdate) + Send + Sync + 'static,
    {
        self.activity.start(Arc::new(callback));
    }

    /// Stops activity reporting and the change watchers behind [`Self::query`].
    pub fn stop_watch(&mut self) {
        self.activity.stop();
        self.watcher.stop();
    }

    /// Releases every watcher and the reconciliation timer.
    pub fn shutdown(&mut self) {
        self.stop_watch();
        self.results.clear();
    }
}
