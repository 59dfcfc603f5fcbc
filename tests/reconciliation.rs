use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use gemini_cli_usage::{ActivityUpdate, EngineSettings, SessionQuery, UsageEngine};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    home: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let home = tmp.path().join(".gemini");
        fs::create_dir_all(home.join("tmp")).expect("mkdir tmp");
        Self { _tmp: tmp, home }
    }

    fn chats(&self, project_hash: &str) -> PathBuf {
        let dir = self.home.join("tmp").join(project_hash).join("chats");
        fs::create_dir_all(&dir).expect("mkdir chats");
        dir
    }

    fn engine(&self) -> UsageEngine {
        UsageEngine::new(EngineSettings::for_home(&self.home))
    }
}

fn gemini_message(id: &str, input: u64, output: u64, cached: u64) -> Value {
    json!({
        "id": id,
        "type": "gemini",
        "timestamp": "2026-04-01T12:00:00Z",
        "model": "gemini-2.5-pro",
        "content": "",
        "tokens": {
            "input": input,
            "output": output,
            "cached": cached,
            "thoughts": 0,
            "tool": 0,
            "total": input + output + cached
        }
    })
}

fn write_session(path: &Path, session_id: &str, messages: Vec<Value>, mtime_ms: u64) {
    let record = json!({
        "sessionId": session_id,
        "projectHash": "hash",
        "startTime": "2026-04-01T11:59:00Z",
        "lastUpdated": "2026-04-01T12:00:00Z",
        "messages": messages
    });
    fs::write(path, record.to_string()).expect("write session");
    set_mtime(path, mtime_ms);
}

fn set_mtime(path: &Path, mtime_ms: u64) {
    let file = File::options().write(true).open(path).expect("open session");
    file.set_modified(UNIX_EPOCH + Duration::from_millis(mtime_ms))
        .expect("set mtime");
}

fn wait_for_updates(received: &Mutex<Vec<ActivityUpdate>>, expected: usize) -> Vec<ActivityUpdate> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while received.lock().expect("sink").len() < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(50));
    received.lock().expect("sink").clone()
}

#[test]
fn end_to_end_orders_by_mtime_and_omits_zero_cache() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    write_session(
        &chats.join("session-a.json"),
        "session-a",
        vec![gemini_message("m1", 10, 5, 0)],
        1_000_000,
    );
    write_session(
        &chats.join("session-b.json"),
        "session-b",
        vec![gemini_message("m2", 3, 1, 2)],
        2_000_000,
    );

    let mut engine = fixture.engine();
    let rows = engine.query(&SessionQuery::all());

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].session_id, "session-b");
    assert_eq!(rows[1].session_id, "session-a");
    assert_eq!(rows[0].tokens.cache_read, Some(2));
    assert_eq!(rows[1].tokens.cache_read, None);
    assert_eq!(rows[0].session_updated_at, 2_000_000);

    let serialized = serde_json::to_value(rows.as_slice()).expect("serialize");
    assert_eq!(serialized[0]["tokens"], json!({"input": 3, "output": 1, "cacheRead": 2}));
    assert_eq!(serialized[1]["tokens"], json!({"input": 10, "output": 5}));
}

#[test]
fn full_pass_discovers_every_session_file_once() {
    let fixture = Fixture::new();
    let first = fixture.chats("hash-a");
    let second = fixture.chats("hash-b");
    fs::create_dir_all(fixture.home.join("tmp").join("hash-c")).expect("project without chats");
    write_session(&first.join("session-1.json"), "s1", vec![gemini_message("a", 1, 1, 0)], 10_000);
    write_session(&first.join("session-2.json"), "s2", vec![gemini_message("b", 1, 1, 0)], 20_000);
    write_session(&second.join("session-3.json"), "s3", vec![gemini_message("c", 1, 1, 0)], 30_000);
    fs::write(first.join("logs.json"), "[]").expect("non-session file");

    let mut engine = fixture.engine();
    let rows = engine.query(&SessionQuery::all());

    let ids: Vec<&str> = rows.iter().map(|row| row.session_id.as_str()).collect();
    assert_eq!(ids, vec!["s3", "s2", "s1"]);
    assert_eq!(engine.last_pass_stats().session_files, 3);
    assert_eq!(engine.metadata().len(), 3);
    assert_eq!(engine.session_watcher().watched_dir_count(), 2);
}

#[test]
fn repeated_query_within_ttl_returns_identical_result() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    write_session(&chats.join("session-a.json"), "a", vec![gemini_message("m1", 4, 1, 0)], 5_000);

    let mut engine = fixture.engine();
    let first = engine.query(&SessionQuery::all());
    let second = engine.query(&SessionQuery::all());

    assert!(Arc::ptr_eq(&first, &second));
    let stats = engine.last_pass_stats();
    assert!(stats.served_from_cache);
    assert_eq!(stats.file_reads, 0);
    assert_eq!(stats.stat_checks, 0);

    let different_limit = engine.query(&SessionQuery::all().limit(10));
    assert!(!Arc::ptr_eq(&first, &different_limit));
    assert!(!engine.last_pass_stats().served_from_cache);
}

#[test]
fn session_query_bypasses_result_cache() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    write_session(&chats.join("session-a.json"), "a", vec![gemini_message("m1", 4, 1, 0)], 5_000);
    write_session(&chats.join("session-b.json"), "b", vec![gemini_message("m2", 4, 1, 0)], 6_000);

    let mut engine = fixture.engine();
    let only_a = engine.query(&SessionQuery::for_session("a"));
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].session_id, "a");

    let all = engine.query(&SessionQuery::all());
    assert!(!engine.last_pass_stats().served_from_cache);
    assert_eq!(all.len(), 2);

    engine.query(&SessionQuery::for_session("a"));
    assert!(!engine.last_pass_stats().served_from_cache);
}

#[test]
fn changed_mtime_never_serves_previous_rows() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    let path = chats.join("session-a.json");
    write_session(&path, "a", vec![gemini_message("m1", 4, 1, 0)], 5_000);

    let mut engine = fixture.engine();
    let before = engine.query(&SessionQuery::for_session("a"));
    assert_eq!(before[0].tokens.input, 4);

    write_session(
        &path,
        "a",
        vec![gemini_message("m1", 40, 1, 0), gemini_message("m2", 7, 1, 0)],
        9_000,
    );
    engine.request_full_reconciliation();
    let after = engine.query(&SessionQuery::for_session("a"));

    assert_eq!(after.len(), 2);
    assert_eq!(after[0].tokens.input, 40);
    assert_eq!(after[1].tokens.input, 7);
    assert_eq!(after[0].session_updated_at, 9_000);
}

#[test]
fn duplicate_message_ids_collapse_to_latest_values() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    write_session(
        &chats.join("session-a.json"),
        "a",
        vec![
            gemini_message("m1", 4, 1, 0),
            gemini_message("m2", 6, 1, 0),
            gemini_message("m1", 9, 3, 1),
        ],
        5_000,
    );

    let mut engine = fixture.engine();
    let rows = engine.query(&SessionQuery::all());
    let inputs: Vec<u64> = rows.iter().map(|row| row.tokens.input).collect();
    assert_eq!(inputs, vec![9, 6]);
    assert_eq!(rows[0].tokens.cache_read, Some(1));
}

#[test]
fn deleted_file_is_evicted_on_full_pass() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    let keep = chats.join("session-keep.json");
    let gone = chats.join("session-gone.json");
    write_session(&keep, "keep", vec![gemini_message("k", 2, 1, 0)], 5_000);
    write_session(&gone, "gone", vec![gemini_message("g", 2, 1, 0)], 6_000);

    let mut engine = fixture.engine();
    assert_eq!(engine.query(&SessionQuery::for_session("gone")).len(), 1);
    assert!(engine.metadata().get(&gone).is_some());

    fs::remove_file(&gone).expect("remove session");
    engine.request_full_reconciliation();
    let rows = engine.query(&SessionQuery::all());

    assert!(engine.metadata().get(&gone).is_none());
    assert_eq!(engine.last_pass_stats().evicted_metadata, 1);
    assert!(rows.iter().all(|row| row.session_id != "gone"));
    assert!(engine.query(&SessionQuery::for_session("gone")).is_empty());
}

#[test]
fn unreadable_files_contribute_no_rows() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    fs::write(chats.join("session-broken.json"), "{not json").expect("write");
    fs::write(chats.join("session-anon.json"), r#"{"messages":[]}"#).expect("write");
    write_session(&chats.join("session-ok.json"), "ok", vec![gemini_message("m", 2, 1, 0)], 5_000);

    let mut engine = fixture.engine();
    let rows = engine.query(&SessionQuery::all());
    assert_eq!(rows.len(), 1);
    assert_eq!(engine.metadata().len(), 1);
}

#[test]
fn activity_watch_reports_only_new_messages() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    let path = chats.join("session-live.json");
    write_session(&path, "live", vec![gemini_message("m1", 5, 2, 0)], 5_000);

    let received: Arc<Mutex<Vec<ActivityUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut engine = fixture.engine();
    engine.start_watch(move |update: &ActivityUpdate| {
        sink.lock().expect("sink").push(update.clone());
    });
    engine.activity().wait_until_primed();

    assert_eq!(engine.activity().seen_message_count(&path), 1);
    engine.activity().notify_changed(&path);
    assert!(received.lock().expect("sink").is_empty());

    let mut appended = gemini_message("m2", 8, 3, 0);
    appended["tokens"]["thoughts"] = json!(4);
    write_session(&path, "live", vec![gemini_message("m1", 5, 2, 0), appended], 6_000);
    engine.activity().notify_changed(&path);
    engine.activity().notify_changed(&path);

    // A filesystem notification may deliver the same change on the watcher thread.
    let updates = wait_for_updates(&received, 1);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].session_id, "live");
    assert_eq!(updates[0].message_id, "m2");
    assert_eq!(updates[0].tokens.input, 8);
    assert_eq!(updates[0].tokens.reasoning, Some(4));

    engine.stop_watch();
    assert!(!engine.activity().is_started());
    assert_eq!(engine.activity().seen_message_count(&path), 0);
}

#[test]
fn watcher_event_marks_appended_file_dirty() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    let path = chats.join("session-a.json");
    write_session(&path, "a", vec![gemini_message("m1", 4, 1, 0)], 5_000);

    let mut engine = fixture.engine();
    assert_eq!(engine.query(&SessionQuery::for_session("a")).len(), 1);
    assert!(engine.session_watcher().is_watching(&chats));

    write_session(
        &path,
        "a",
        vec![gemini_message("m1", 4, 1, 0), gemini_message("m2", 6, 2, 0)],
        8_000,
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut rows = engine.query(&SessionQuery::for_session("a"));
    while rows.len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
        rows = engine.query(&SessionQuery::for_session("a"));
    }

    assert_eq!(rows.len(), 2, "change notification never reached the engine");
    let stats = engine.last_pass_stats();
    assert!(!stats.forced_full);
    assert_eq!(stats.dirty_hits, 1);
    assert_eq!(rows[1].tokens.input, 6);
    assert_eq!(rows[1].session_updated_at, 8_000);
}

#[test]
fn project_moved_into_root_is_primed_and_tailed() {
    let fixture = Fixture::new();
    let chats = fixture.chats("hash-a");
    write_session(
        &chats.join("session-a.json"),
        "a",
        vec![gemini_message("m1", 5, 2, 0)],
        5_000,
    );

    let staging = fixture.home.join("staging").join("hash-new");
    let staged_chats = staging.join("chats");
    fs::create_dir_all(&staged_chats).expect("mkdir staged chats");
    write_session(
        &staged_chats.join("session-x.json"),
        "x",
        vec![gemini_message("x1", 3, 1, 0)],
        5_000,
    );

    let received: Arc<Mutex<Vec<ActivityUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut engine = fixture.engine();
    engine.start_watch(move |update: &ActivityUpdate| {
        sink.lock().expect("sink").push(update.clone());
    });
    engine.activity().wait_until_primed();
    assert_eq!(engine.activity().watched_dir_count(), 1);

    let project = fixture.home.join("tmp").join("hash-new");
    fs::rename(&staging, &project).expect("move project into root");
    let moved = project.join("chats").join("session-x.json");

    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.activity().seen_message_count(&moved) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(engine.activity().watched_dir_count(), 2);
    assert_eq!(engine.activity().seen_message_count(&moved), 1);
    assert!(received.lock().expect("sink").is_empty());

    write_session(
        &moved,
        "x",
        vec![gemini_message("x1", 3, 1, 0), gemini_message("x2", 9, 4, 0)],
        6_000,
    );

    let updates = wait_for_updates(&received, 1);
    let ids: Vec<&str> = updates.iter().map(|update| update.message_id.as_str()).collect();
    assert_eq!(ids, vec!["x2"]);
    assert_eq!(updates[0].session_id, "x");

    engine.stop_watch();
}
