use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::usage::UsageRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub modified_at_ms: i64,
    pub session_id: String,
}

/// Last-seen modification time and session id per session file.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    entries: HashMap<PathBuf, MetadataEntry>,
}

impl MetadataIndex {
    pub fn get(&self, path: &Path) -> Option<&MetadataEntry> {
        self.entries.get(path)
    }

    pub fn set(&mut self, path: PathBuf, entry: MetadataEntry) {
        self.entries.insert(path, entry);
    }

    pub fn delete(&mut self, path: &Path) -> Option<MetadataEntry> {
        self.entries.remove(path)
    }

    /// Drops every entry whose path was not part of the latest enumeration.
    /// Returns the number of evicted entries.
    pub fn retain_seen(&mut self, seen: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| seen.contains(path));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AggregateEntry {
    /// File modification time the rows were computed from.
    pub updated_at_ms: i64,
    pub usage_rows: Vec<UsageRow>,
    pub last_accessed_ms: i64,
}

/// Usage rows per session id, bounded by entry count.
#[derive(Debug)]
pub struct AggregateCache {
    capacity: usize,
    entries: HashMap<String, AggregateEntry>,
}

impl AggregateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// Rows computed from exactly `modified_at_ms`, bumping the entry's recency on a hit.
    /// An entry for an older or newer modification time is not returned.
    pub fn get_fresh(
        &mut self,
        session_id: &str,
        modified_at_ms: i64,
        now_ms: i64,
    ) -> Option<&[UsageRow]> {
        let entry = self.entries.get_mut(session_id)?;
        if entry.updated_at_ms != modified_at_ms {
            return None;
        }
        entry.last_accessed_ms = now_ms;
        Some(&entry.usage_rows)
    }

    pub fn get(&self, session_id: &str) -> Option<&AggregateEntry> {
        self.entries.get(session_id)
    }

    pub fn set(&mut self, session_id: String, entry: AggregateEntry) {
        self.entries.insert(session_id, entry);
    }

    /// Removes least-recently-accessed entries until the capacity bound holds.
    pub fn evict(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }

        let mut by_recency: Vec<(i64, String)> = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.last_accessed_ms, id.clone()))
            .collect();
        by_recency.sort();
        for (_, id) in by_recency.into_iter().take(excess) {
            self.entries.remove(&id);
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct CachedResult {
    checked_at: Instant,
    rows: Arc<Vec<UsageRow>>,
    limit: usize,
    since: Option<i64>,
}

/// Last unfiltered query result, served again while parameters match and the TTL holds.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    last: Option<CachedResult>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, last: None }
    }

    pub fn lookup(&self, limit: usize, since: Option<i64>) -> Option<Arc<Vec<UsageRow>>> {
        let last = self.last.as_ref()?;
        if last.limit != limit || last.since != since || last.rows.is_empty() {
            return None;
        }
        if last.checked_at.elapsed() >= self.ttl {
            return None;
        }
        Some(Arc::clone(&last.rows))
    }

    pub fn store(&mut self, rows: Arc<Vec<UsageRow>>, limit: usize, since: Option<i64>) {
        self.last = Some(CachedResult {
            checked_at: Instant::now(),
            rows,
            limit,
            since,
        });
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}
