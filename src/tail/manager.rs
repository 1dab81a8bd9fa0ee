// SPDX-License-Identifier: Apache-2.0

//! The live set of tail watchers and the engine loop that drives them.
//!
//! One dedicated OS thread runs all watcher callbacks: trigger servicing,
//! rotation hand-offs, reconciliation against the desired state, and
//! progress publishing all execute serialized on this loop, so per-watcher
//! state needs no locking against other watchers. The loop blocks on its
//! control channel with a short timeout; config-change notifications from
//! the coordination client arrive there, cancellation comes from the
//! daemon's shutdown token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::coordination::Coordination;
use crate::exporters::OutputBuilder;
use crate::tail::position::{
    entry_position, swap_to_memory, Position, PositionEntry, PositionFile, SharedPositionEntry,
};
use crate::tail::task::{expand_path_pattern, parse_desired_state, TaskConfig};
use crate::tail::watcher::{Progress, TailWatcher};

/// Engine loop granularity. Trigger deadlines are tracked per watcher, so
/// this only bounds how late a due trigger can fire.
const TICK: Duration = Duration::from_millis(250);

/// Events delivered to the engine loop from other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The desired-state document changed in the coordination service.
    ConfigChanged,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Desired-state refresh period (also the reconcile floor).
    pub refresh_interval: Duration,
    /// Progress-publish period.
    pub upload_interval: Duration,
    /// Inactivity threshold for retiring quiet watchers.
    pub stat_silent_max_ms: u64,
    /// Per-line byte cap applied to every reader.
    pub line_max_bytes: usize,
}

pub struct Manager {
    config: ManagerConfig,
    positions: PositionFile,
    coordination: Arc<dyn Coordination>,
    outputs: Arc<dyn OutputBuilder>,

    /// Live set, keyed by path pattern (the task identity).
    watchers: HashMap<String, TailWatcher>,
    /// Stopped watchers owed one final drain before being dropped.
    draining: Vec<TailWatcher>,

    last_reconcile: Option<Instant>,
    last_upload: Option<Instant>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        positions: PositionFile,
        coordination: Arc<dyn Coordination>,
        outputs: Arc<dyn OutputBuilder>,
    ) -> Self {
        Self {
            config,
            positions,
            coordination,
            outputs,
            watchers: HashMap::new(),
            draining: Vec::new(),
            last_reconcile: None,
            last_upload: None,
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Run the engine loop until cancelled. Consumes the manager; the final
    /// tick drains and closes every watcher.
    pub fn run(mut self, events: BoundedReceiver<EngineEvent>, cancel: CancellationToken) {
        info!("Starting tail engine");

        self.reconcile(Instant::now());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match events.recv_timeout(TICK) {
                Some(EngineEvent::ConfigChanged) => {
                    debug!("desired state changed, reconciling");
                    self.reconcile(Instant::now());
                }
                None => {
                    if events.is_disconnected() {
                        break;
                    }
                }
            }

            self.tick(Instant::now());
        }

        self.shutdown();
        info!("Tail engine stopped");
    }

    /// One pass of the engine loop. Public so scenario tests can drive the
    /// engine without threads.
    pub fn tick(&mut self, now: Instant) {
        for watcher in self.watchers.values_mut() {
            watcher.service(now);
        }

        self.process_reassignments();
        self.drain_stopped();

        let reconcile_due = match self.last_reconcile {
            Some(at) => now.duration_since(at) >= self.config.refresh_interval,
            None => true,
        };
        if reconcile_due {
            self.reconcile(now);
        }

        let upload_due = match self.last_upload {
            Some(at) => now.duration_since(at) >= self.config.upload_interval,
            None => true,
        };
        if upload_due {
            self.publish_progress();
            self.last_upload = Some(now);
        }
    }

    /// Bring the live set in line with the desired-state document.
    pub fn reconcile(&mut self, now: Instant) {
        self.last_reconcile = Some(now);

        let document = self.coordination.log_config();
        let desired = match parse_desired_state(&document) {
            Ok(desired) => desired,
            Err(e) => {
                warn!(error = %e, "invalid desired-state document, keeping current set");
                return;
            }
        };

        // Expand patterns against the current wall clock.
        let mut expanded: HashMap<String, (String, TaskConfig)> = HashMap::new();
        let local_now = chrono::Local::now();
        for (pattern, conf) in desired {
            if !conf.enabled {
                continue;
            }
            match expand_path_pattern(&pattern, local_now) {
                Ok(path) => {
                    expanded.insert(pattern, (path, conf));
                }
                Err(e) => {
                    warn!(pattern, error = %e, "failed to expand path pattern");
                }
            }
        }

        // Remove watchers that are no longer desired, were unwatched by
        // errors, or have gone silent past the threshold.
        let mut remove = Vec::new();
        for (pattern, watcher) in &self.watchers {
            if !expanded.contains_key(pattern) {
                remove.push((pattern.clone(), "undesired"));
            } else if watcher.is_unwatched() {
                remove.push((pattern.clone(), "unwatched"));
            } else if !watcher.is_active() {
                remove.push((pattern.clone(), "inactive"));
            }
        }
        for (pattern, reason) in remove {
            info!(pattern, reason, "removing watcher");
            if let Some(mut watcher) = self.watchers.remove(&pattern) {
                watcher.stop(false);
                self.draining.push(watcher);
            }
        }

        // Create or update the rest.
        for (pattern, (path, conf)) in expanded {
            let path_changed = match self.watchers.get(&pattern) {
                None => {
                    self.create_watcher(pattern, path, conf, None);
                    continue;
                }
                Some(watcher) => watcher.path() != path,
            };

            if path_changed {
                // The pattern now expands to a different concrete path
                // (calendar rolled over). Let the old watcher drain the
                // outgoing file against an in-memory entry and seed the
                // new path's checkpoint from the prior one.
                let mut old = self
                    .watchers
                    .remove(&pattern)
                    .expect("watcher present in branch");
                info!(pattern, old = old.path(), new = %path, "expanded path changed");
                let prior = swap_to_memory(old.position_entry());
                old.stop(false);
                self.draining.push(old);

                let seed = entry_position(&prior);
                self.create_watcher(pattern, path, conf, Some(seed));
                continue;
            }

            self.refresh_watcher(&pattern, conf);
        }
    }

    /// Push changed task fields onto a live watcher, rebuilding the sink
    /// only when producer-level settings moved.
    fn refresh_watcher(&mut self, pattern: &str, conf: TaskConfig) {
        let rebuild = {
            let Some(watcher) = self.watchers.get(pattern) else {
                return;
            };
            if *watcher.conf() == conf {
                return;
            }
            !watcher.conf().same_producer_settings(&conf)
        };

        let output = if rebuild {
            debug!(pattern, "task producer settings changed, rebuilding sink");
            match self.outputs.build(&conf, &self.coordination.broker_urls()) {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!(pattern, error = %e, "failed to rebuild sink, keeping old settings");
                    return;
                }
            }
        } else {
            debug!(pattern, "hot-swapping task config");
            None
        };

        if let Some(watcher) = self.watchers.get_mut(pattern) {
            if let Some(output) = output {
                watcher.set_output(output);
            }
            watcher.update_conf(conf);
        }
    }

    fn create_watcher(
        &mut self,
        pattern: String,
        path: String,
        conf: TaskConfig,
        seed: Option<Position>,
    ) {
        let brokers = self.coordination.broker_urls();
        let output = match self.outputs.build(&conf, &brokers) {
            Ok(output) => output,
            Err(e) => {
                warn!(pattern, error = %e, "cannot build output yet, retrying next reconcile");
                return;
            }
        };

        if let Some(seed) = seed {
            if let Err(e) = self.positions.update(&path, seed.ino, seed.offset) {
                warn!(pattern, error = %e, "failed to seed checkpoint for new path");
            }
        }

        info!(pattern, path, "creating watcher");
        let entry = PositionEntry::durable(self.positions.clone(), path.clone());
        let mut watcher = TailWatcher::new(
            pattern.clone(),
            path,
            entry,
            conf,
            output,
            self.config.stat_silent_max_ms,
            self.config.line_max_bytes,
        );
        watcher.start();
        self.watchers.insert(pattern, watcher);
    }

    /// Apply rotation hand-offs queued by watchers during their notifies:
    /// the outgoing watcher drains on the side while a successor takes over
    /// the path with the detached durable entry.
    fn process_reassignments(&mut self) {
        let mut pending: Vec<(String, SharedPositionEntry)> = Vec::new();
        for (pattern, watcher) in self.watchers.iter_mut() {
            if let Some(entry) = watcher.take_reassign() {
                pending.push((pattern.clone(), entry));
            }
        }

        for (pattern, entry) in pending {
            let Some(mut old) = self.watchers.remove(&pattern) else {
                continue;
            };
            let path = old.path().to_string();
            let conf = old.conf().clone();
            old.stop(false);
            self.draining.push(old);

            let brokers = self.coordination.broker_urls();
            let output = match self.outputs.build(&conf, &brokers) {
                Ok(output) => output,
                Err(e) => {
                    warn!(pattern, error = %e, "cannot build output for rotated file");
                    continue;
                }
            };

            info!(pattern, path, "rebinding watcher after rotation");
            let mut replacement = TailWatcher::new(
                pattern.clone(),
                path,
                entry,
                conf,
                output,
                self.config.stat_silent_max_ms,
                self.config.line_max_bytes,
            );
            replacement.start();
            self.watchers.insert(pattern, replacement);
        }
    }

    /// Deliver the one post-stop notify each stopped watcher is owed, then
    /// drop it.
    fn drain_stopped(&mut self) {
        for mut watcher in self.draining.drain(..) {
            watcher.finish();
        }
    }

    /// Publish `[{realpath, filepos, filesize}]` for this host.
    fn publish_progress(&mut self) {
        let snapshots: Vec<Progress> = self.watchers.values().map(TailWatcher::progress).collect();

        match serde_json::to_vec(&snapshots) {
            Ok(payload) => self.coordination.publish_state(payload),
            Err(e) => error!(error = %e, "failed to serialize progress snapshot"),
        }
    }

    fn shutdown(&mut self) {
        info!(watchers = self.watchers.len(), "stopping all watchers");
        for (_, mut watcher) in self.watchers.drain() {
            watcher.stop(true);
        }
        self.drain_stopped();
        self.publish_progress();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::{BoxError, Output, PushOutcome};
    use std::fs;
    use std::io::Write;
    use std::sync::Mutex;

    struct MockCoordination {
        config: Mutex<String>,
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl MockCoordination {
        fn new(config: &str) -> Arc<Self> {
            Arc::new(Self {
                config: Mutex::new(config.to_string()),
                published: Mutex::new(Vec::new()),
            })
        }

        fn set_config(&self, config: &str) {
            *self.config.lock().unwrap() = config.to_string();
        }

        fn published(&self) -> Vec<Vec<u8>> {
            self.published.lock().unwrap().clone()
        }
    }

    impl Coordination for MockCoordination {
        fn broker_urls(&self) -> String {
            "localhost:9092".to_string()
        }

        fn log_config(&self) -> String {
            self.config.lock().unwrap().clone()
        }

        fn publish_state(&self, payload: Vec<u8>) {
            self.published.lock().unwrap().push(payload);
        }
    }

    struct TestOutput {
        lines: Mutex<Vec<(String, String)>>,
    }

    impl Output for TestOutput {
        fn push(&self, topic: &str, _key: Option<&str>, payload: &[u8]) -> PushOutcome {
            self.lines.lock().unwrap().push((
                topic.to_string(),
                String::from_utf8_lossy(payload).to_string(),
            ));
            PushOutcome::Accepted
        }

        fn close(&self) {}
    }

    struct TestOutputBuilder {
        output: Arc<TestOutput>,
    }

    impl TestOutputBuilder {
        fn new() -> (Arc<Self>, Arc<TestOutput>) {
            let output = Arc::new(TestOutput {
                lines: Mutex::new(Vec::new()),
            });
            (
                Arc::new(Self {
                    output: output.clone(),
                }),
                output,
            )
        }
    }

    impl OutputBuilder for TestOutputBuilder {
        fn build(
            &self,
            _conf: &TaskConfig,
            _brokers: &str,
        ) -> Result<Arc<dyn Output>, BoxError> {
            Ok(self.output.clone())
        }
    }

    fn manager_config() -> ManagerConfig {
        ManagerConfig {
            refresh_interval: Duration::from_secs(3600),
            upload_interval: Duration::from_secs(3600),
            stat_silent_max_ms: 10_000,
            line_max_bytes: 1024 * 1024,
        }
    }

    fn task_doc(path: &std::path::Path, extra: &str) -> String {
        format!(
            r#"{{"{}": {{"topic": "t", "read_from_head": true{}}}}}"#,
            path.display(),
            extra
        )
    }

    #[test]
    fn reconcile_creates_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"one\ntwo\n").unwrap();

        let coordination = MockCoordination::new(&task_doc(&path, ""));
        let (builder, output) = TestOutputBuilder::new();
        let mut manager = Manager::new(
            manager_config(),
            PositionFile::open_memory(),
            coordination.clone(),
            builder,
        );

        manager.reconcile(Instant::now());
        assert_eq!(manager.watcher_count(), 1);
        assert_eq!(
            output.lines.lock().unwrap().clone(),
            vec![
                ("t".to_string(), "one".to_string()),
                ("t".to_string(), "two".to_string())
            ]
        );

        coordination.set_config("{}");
        manager.reconcile(Instant::now());
        manager.tick(Instant::now());
        assert_eq!(manager.watcher_count(), 0);
    }

    #[test]
    fn invalid_document_keeps_current_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"one\n").unwrap();

        let coordination = MockCoordination::new(&task_doc(&path, ""));
        let (builder, _output) = TestOutputBuilder::new();
        let mut manager = Manager::new(
            manager_config(),
            PositionFile::open_memory(),
            coordination.clone(),
            builder,
        );

        manager.reconcile(Instant::now());
        assert_eq!(manager.watcher_count(), 1);

        coordination.set_config("not json {{{");
        manager.reconcile(Instant::now());
        assert_eq!(manager.watcher_count(), 1);
    }

    #[test]
    fn disabled_task_not_tailed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"one\n").unwrap();

        let coordination = MockCoordination::new(&task_doc(&path, r#", "enabled": false"#));
        let (builder, output) = TestOutputBuilder::new();
        let mut manager = Manager::new(
            manager_config(),
            PositionFile::open_memory(),
            coordination,
            builder,
        );

        manager.reconcile(Instant::now());
        assert_eq!(manager.watcher_count(), 0);
        assert!(output.lines.lock().unwrap().is_empty());
    }

    #[test]
    fn hot_swaps_topic_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"one\n").unwrap();

        let coordination = MockCoordination::new(&task_doc(&path, ""));
        let (builder, output) = TestOutputBuilder::new();
        let mut manager = Manager::new(
            manager_config(),
            PositionFile::open_memory(),
            coordination.clone(),
            builder,
        );

        manager.reconcile(Instant::now());

        coordination.set_config(&format!(
            r#"{{"{}": {{"topic": "t2", "read_from_head": true}}}}"#,
            path.display()
        ));
        manager.reconcile(Instant::now());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"two\n").unwrap();
        drop(f);

        manager.tick(Instant::now() + Duration::from_millis(1100));

        let lines = output.lines.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                ("t".to_string(), "one".to_string()),
                ("t2".to_string(), "two".to_string())
            ]
        );
    }

    #[test]
    fn rotation_rebinds_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"first\n").unwrap();

        let store = PositionFile::open_memory();
        let coordination = MockCoordination::new(&task_doc(&path, ""));
        let (builder, output) = TestOutputBuilder::new();
        let mut manager = Manager::new(
            manager_config(),
            store.clone(),
            coordination,
            builder,
        );

        let start = Instant::now();
        manager.reconcile(start);

        // Writer appends a final line, then the file rotates.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"last\n").unwrap();
        drop(f);
        fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        fs::write(&path, b"new\n").unwrap();

        // Next stat tick notices the rotation, drains the outgoing file,
        // and rebinds a successor watcher to the fresh inode.
        manager.tick(start + Duration::from_millis(1100));

        let lines: Vec<String> = output
            .lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        assert_eq!(lines, vec!["first", "last", "new"]);

        let key = path.to_string_lossy().to_string();
        let new_ino = {
            use std::os::unix::fs::MetadataExt;
            fs::metadata(&path).unwrap().ino()
        };
        assert_eq!(store.get(&key).ino, new_ino);
        assert_eq!(store.get(&key).offset, 4);
        assert_eq!(manager.watcher_count(), 1);
    }

    #[test]
    fn publishes_progress_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"ab\n").unwrap();

        let coordination = MockCoordination::new(&task_doc(&path, ""));
        let (builder, _output) = TestOutputBuilder::new();
        let mut manager = Manager::new(
            manager_config(),
            PositionFile::open_memory(),
            coordination.clone(),
            builder,
        );

        manager.reconcile(Instant::now());
        manager.tick(Instant::now());

        let published = coordination.published();
        assert_eq!(published.len(), 1);

        let snapshots: Vec<serde_json::Value> = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0]["realpath"],
            serde_json::json!(path.to_string_lossy())
        );
        assert_eq!(snapshots[0]["filepos"], serde_json::json!(3));
        assert_eq!(snapshots[0]["filesize"], serde_json::json!(3));
    }
}
