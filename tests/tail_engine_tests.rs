// SPDX-License-Identifier: Apache-2.0

//! End-to-end tail-engine scenarios: a desired-state document, a real file
//! on disk, and a collecting sink, driven through the manager's tick entry
//! points without threads.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use logship::coordination::Coordination;
use logship::exporters::{BoxError, Output, OutputBuilder, PushOutcome};
use logship::tail::manager::{Manager, ManagerConfig};
use logship::tail::position::PositionFile;
use logship::tail::task::TaskConfig;

struct StaticCoordination {
    config: Mutex<String>,
}

impl StaticCoordination {
    fn new(config: String) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
        })
    }
}

impl Coordination for StaticCoordination {
    fn broker_urls(&self) -> String {
        "localhost:9092".to_string()
    }

    fn log_config(&self) -> String {
        self.config.lock().unwrap().clone()
    }

    fn publish_state(&self, _payload: Vec<u8>) {}
}

#[derive(Default)]
struct CollectingOutput {
    lines: Mutex<Vec<String>>,
}

impl CollectingOutput {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Output for CollectingOutput {
    fn push(&self, _topic: &str, _key: Option<&str>, payload: &[u8]) -> PushOutcome {
        self.lines
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).to_string());
        PushOutcome::Accepted
    }

    fn close(&self) {}
}

struct CollectingBuilder {
    output: Arc<CollectingOutput>,
}

impl OutputBuilder for CollectingBuilder {
    fn build(&self, _conf: &TaskConfig, _brokers: &str) -> Result<Arc<dyn Output>, BoxError> {
        Ok(self.output.clone())
    }
}

fn desired_state_for(path: &Path) -> String {
    format!(
        r#"{{"{}": {{"topic": "logs", "read_from_head": true}}}}"#,
        path.display()
    )
}

fn engine_for(
    path: &Path,
    positions: PositionFile,
) -> (Manager, Arc<CollectingOutput>) {
    let output = Arc::new(CollectingOutput::default());
    let manager = Manager::new(
        ManagerConfig {
            refresh_interval: Duration::from_secs(3600),
            upload_interval: Duration::from_secs(3600),
            stat_silent_max_ms: 10_000,
            line_max_bytes: 1024 * 1024,
        },
        positions,
        StaticCoordination::new(desired_state_for(path)),
        Arc::new(CollectingBuilder {
            output: output.clone(),
        }),
    );
    (manager, output)
}

fn append(path: &Path, bytes: &[u8]) {
    let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
    f.write_all(bytes).unwrap();
}

#[test]
fn append_truncate_rotate_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"").unwrap();

    let store = PositionFile::open_memory();
    let (mut manager, output) = engine_for(&path, store.clone());
    let key = path.to_string_lossy().to_string();

    let mut clock = Instant::now();
    manager.reconcile(clock);
    let mut tick = |manager: &mut Manager| {
        clock += Duration::from_millis(1100);
        manager.tick(clock);
    };

    // Phase 1: plain appends.
    append(&path, b"hello\nworld\n");
    tick(&mut manager);
    assert_eq!(output.lines(), vec!["hello", "world"]);
    assert_eq!(store.get(&key).offset, 12);

    // Phase 2: a partial line stays put until its newline arrives.
    append(&path, b"foo");
    tick(&mut manager);
    assert_eq!(output.lines().len(), 2);
    assert_eq!(store.get(&key).offset, 12);

    append(&path, b"\n");
    tick(&mut manager);
    assert_eq!(output.lines(), vec!["hello", "world", "foo"]);
    assert_eq!(store.get(&key).offset, 16);

    // Phase 3: truncation resets the checkpoint in place.
    let f = fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(0).unwrap();
    drop(f);
    tick(&mut manager);
    assert_eq!(store.get(&key).offset, 0);

    append(&path, b"after-truncate\n");
    tick(&mut manager);
    assert_eq!(
        output.lines().last().map(String::as_str),
        Some("after-truncate")
    );
    assert_eq!(store.get(&key).offset, 15);

    // Phase 4: rotation. The pending line in the outgoing file is drained
    // before the watcher rebinds to the fresh inode.
    append(&path, b"last\n");
    fs::rename(&path, dir.path().join("app.log.1")).unwrap();
    fs::write(&path, b"new\n").unwrap();
    tick(&mut manager);

    assert_eq!(
        output.lines(),
        vec!["hello", "world", "foo", "after-truncate", "last", "new"]
    );
    assert_eq!(store.get(&key).offset, 4);

    // Every line arrived exactly once across the whole lifecycle.
    let mut sorted = output.lines();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 6);
}

#[test]
fn restart_resumes_after_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    let pos_path = dir.path().join("positions.json");
    fs::write(&path, b"one\ntwo\n").unwrap();

    // First incarnation reads both lines and checkpoints durably.
    {
        let store = PositionFile::open(&pos_path).unwrap();
        let (mut manager, output) = engine_for(&path, store);
        manager.reconcile(Instant::now());
        assert_eq!(output.lines(), vec!["one", "two"]);
    }

    // More data lands while the daemon is down.
    append(&path, b"three\n");

    // The restarted daemon delivers only the line after the checkpoint.
    let store = PositionFile::open(&pos_path).unwrap();
    let (mut manager, output) = engine_for(&path, store.clone());
    manager.reconcile(Instant::now());

    assert_eq!(output.lines(), vec!["three"]);
    assert_eq!(store.get(&path.to_string_lossy()).offset, 14);
}

#[test]
fn read_from_tail_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, b"old-line\n").unwrap();

    let output = Arc::new(CollectingOutput::default());
    let coordination = StaticCoordination::new(format!(
        r#"{{"{}": {{"topic": "logs"}}}}"#,
        path.display()
    ));
    let store = PositionFile::open_memory();
    let mut manager = Manager::new(
        ManagerConfig {
            refresh_interval: Duration::from_secs(3600),
            upload_interval: Duration::from_secs(3600),
            stat_silent_max_ms: 10_000,
            line_max_bytes: 1024 * 1024,
        },
        store.clone(),
        coordination,
        Arc::new(CollectingBuilder {
            output: output.clone(),
        }),
    );

    let start = Instant::now();
    manager.reconcile(start);
    assert!(output.lines().is_empty());
    assert_eq!(store.get(&path.to_string_lossy()).offset, 9);

    append(&path, b"new-line\n");
    manager.tick(start + Duration::from_millis(1100));
    assert_eq!(output.lines(), vec!["new-line"]);
}
