// SPDX-License-Identifier: Apache-2.0

//! Per-path tail watcher: one rotate detector, one optional reader, two
//! trigger clocks, one durable position entry.
//!
//! Two triggers funnel into the same `notify` entry point: a stat-driven
//! one on a short interval that catches rotations and new data promptly,
//! and a timer-driven one on a longer interval as a floor so progress
//! continues even when nothing else fires. `notify` first lets the rotate
//! detector (re)install the reader, then drains newly appended lines.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exporters::Output;
use crate::tail::position::{
    entry_position, entry_update, entry_update_pos, swap_to_memory, SharedPositionEntry, INO_NONE,
};
use crate::tail::reader::IoReader;
use crate::tail::rotate::RotateDetector;
use crate::tail::task::TaskConfig;

pub const STAT_TRIGGER_INTERVAL_MS: u64 = 1000;
pub const TIMER_TRIGGER_REPEAT_MS: u64 = 3000;

/// Consecutive notify failures after which the watcher gives up and asks
/// the manager to reap it.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// The inactivity threshold must exceed both trigger intervals, otherwise
/// every watcher looks dead between its own ticks.
pub fn is_stat_silent_max_ms_valid(stat_silent_max_ms: u64) -> bool {
    stat_silent_max_ms > STAT_TRIGGER_INTERVAL_MS.max(TIMER_TRIGGER_REPEAT_MS)
}

/// Per-watcher progress, aggregated per host for the coordination service.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub realpath: String,
    pub filepos: i64,
    pub filesize: i64,
}

pub struct TailWatcher {
    path_pattern: String,
    path: String,
    conf: TaskConfig,
    entry: SharedPositionEntry,
    rotate: RotateDetector,
    /// Guards the reader slot against a progress snapshot taken while the
    /// rotate callback swaps readers.
    reader: Mutex<Option<IoReader>>,
    output: Arc<dyn Output>,
    stat_silent_max_ms: u64,
    line_max_bytes: usize,

    stopped: bool,
    unwatched: bool,
    consecutive_errors: u32,
    /// Durable entry detached by a rotation hand-off, waiting for the
    /// manager to seed a successor watcher with it.
    pending_reassign: Option<SharedPositionEntry>,

    next_stat_at: Instant,
    next_timer_at: Instant,
}

impl TailWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path_pattern: impl Into<String>,
        path: impl Into<String>,
        entry: SharedPositionEntry,
        conf: TaskConfig,
        output: Arc<dyn Output>,
        stat_silent_max_ms: u64,
        line_max_bytes: usize,
    ) -> Self {
        let path = path.into();
        let now = Instant::now();
        Self {
            path_pattern: path_pattern.into(),
            rotate: RotateDetector::new(&path),
            path,
            conf,
            entry,
            reader: Mutex::new(None),
            output,
            stat_silent_max_ms,
            line_max_bytes,
            stopped: false,
            unwatched: false,
            consecutive_errors: 0,
            pending_reassign: None,
            next_stat_at: now,
            next_timer_at: now,
        }
    }

    pub fn path_pattern(&self) -> &str {
        &self.path_pattern
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn conf(&self) -> &TaskConfig {
        &self.conf
    }

    pub fn position_entry(&self) -> &SharedPositionEntry {
        &self.entry
    }

    /// Marked by repeated unrecoverable errors; the manager reaps these.
    pub fn is_unwatched(&self) -> bool {
        self.unwatched
    }

    /// Start both triggers and deliver one immediate notify.
    pub fn start(&mut self) {
        let now = Instant::now();
        self.next_stat_at = now + Duration::from_millis(STAT_TRIGGER_INTERVAL_MS);
        self.next_timer_at = now + Duration::from_millis(TIMER_TRIGGER_REPEAT_MS);
        self.notify();
    }

    /// Fire whichever triggers are due. Called by the engine loop each tick.
    pub fn service(&mut self, now: Instant) {
        if self.stopped {
            return;
        }

        let mut due = false;
        if now >= self.next_stat_at {
            self.next_stat_at = now + Duration::from_millis(STAT_TRIGGER_INTERVAL_MS);
            due = true;
        }
        if now >= self.next_timer_at {
            self.next_timer_at = now + Duration::from_millis(TIMER_TRIGGER_REPEAT_MS);
            due = true;
        }

        if due {
            self.notify();
        }
    }

    /// The single trigger target: rotation check first, then drain.
    pub fn notify(&mut self) {
        if let Some(file) = self.rotate.check() {
            self.on_rotate(file);
        }

        let drained = {
            let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            guard.as_mut().map(|reader| {
                reader.drain(
                    self.output.as_ref(),
                    &self.conf.topic,
                    self.conf.partition_strategy.key(),
                )
            })
        };

        match drained {
            Some(Ok(_)) => self.consecutive_errors = 0,
            Some(Err(e)) => {
                warn!(path = %self.path, error = %e, "drain failed, will retry next tick");
                self.record_error();
            }
            None => {}
        }
    }

    /// Rotate callback: the detector observed an identity change or a
    /// truncation and handed over a freshly opened handle. The handle is
    /// either moved into a reader or dropped here.
    fn on_rotate(&mut self, file: File) {
        let (ino, size) = match file.metadata() {
            Ok(md) => (md.ino(), md.len()),
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to stat rotated handle");
                self.record_error();
                return;
            }
        };

        let mut failed = false;
        let mut reassign = None;
        {
            let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            let last = entry_position(&self.entry);

            if guard.is_none() {
                // First handle for this watcher. Resume when the stored
                // checkpoint refers to this very file; a never-opened path
                // starts per read_from_head; a different real inode means
                // the stored file is gone, so start over.
                let res = if ino == last.ino {
                    Ok(())
                } else if last.ino != INO_NONE {
                    entry_update(&self.entry, ino, 0)
                } else {
                    let pos = if self.conf.read_from_head { 0 } else { size };
                    entry_update(&self.entry, ino, pos)
                };

                match res {
                    Ok(()) => {
                        debug!(path = %self.path, ino, "installing reader");
                        *guard = Some(self.make_reader(file));
                    }
                    Err(e) => {
                        warn!(path = %self.path, error = %e, "failed to checkpoint new file");
                        failed = true;
                    }
                }
            } else if ino == last.ino {
                // Truncation: same file, shorter. The checkpoint moves to
                // the new end-of-file and a fresh reader takes over.
                match entry_update_pos(&self.entry, size) {
                    Ok(()) => {
                        info!(path = %self.path, size, "file truncated, checkpoint reset");
                        if let Some(mut old) = guard.take() {
                            old.close();
                        }
                        *guard = Some(self.make_reader(file));
                    }
                    Err(e) => {
                        warn!(path = %self.path, error = %e, "failed to reset checkpoint on truncation");
                        failed = true;
                    }
                }
            } else if !guard.as_ref().map(IoReader::is_open).unwrap_or(false) {
                // The old handle is already gone; nothing left to drain.
                match entry_update(&self.entry, ino, 0) {
                    Ok(()) => *guard = Some(self.make_reader(file)),
                    Err(e) => {
                        warn!(path = %self.path, error = %e, "failed to checkpoint replacement file");
                        failed = true;
                    }
                }
            } else {
                // Real rotation with a live reader: detach the durable
                // entry for the successor watcher and let the old reader
                // finish the outgoing file against an in-memory copy. The
                // fresh handle is dropped; the successor's own detector
                // reopens the path.
                info!(path = %self.path, old_ino = last.ino, new_ino = ino, "rotation detected, handing off");
                reassign = Some(swap_to_memory(&self.entry));
            }
        }

        if failed {
            self.record_error();
        }
        if reassign.is_some() {
            self.pending_reassign = reassign;
        }
    }

    fn make_reader(&self, file: File) -> IoReader {
        IoReader::new(
            file,
            self.entry.clone(),
            self.conf.max_lines_per_tick,
            self.line_max_bytes,
        )
    }

    fn record_error(&mut self) {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            warn!(path = %self.path, "too many consecutive errors, unwatching");
            self.unwatched = true;
        }
    }

    /// Take the entry detached by a rotation hand-off, if one is pending.
    pub fn take_reassign(&mut self) -> Option<SharedPositionEntry> {
        self.pending_reassign.take()
    }

    /// Stop both triggers. With `close_io` the final drain and close happen
    /// immediately; without it the manager delivers the last notify before
    /// dropping the watcher.
    pub fn stop(&mut self, close_io: bool) {
        self.stopped = true;
        if close_io {
            self.finish();
        }
    }

    /// Final drain, then release the handle and flush the sink.
    pub fn finish(&mut self) {
        self.stopped = true;

        let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = guard.as_mut() {
            if let Err(e) = reader.drain(
                self.output.as_ref(),
                &self.conf.topic,
                self.conf.partition_strategy.key(),
            ) {
                warn!(path = %self.path, error = %e, "final drain failed");
            }
            reader.close();
        }
        drop(guard);

        self.output.close();
    }

    /// Hot-swap task fields that do not require a new producer.
    pub fn update_conf(&mut self, conf: TaskConfig) {
        let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = guard.as_mut() {
            reader.set_max_lines_per_tick(conf.max_lines_per_tick);
        }
        drop(guard);
        self.conf = conf;
    }

    /// Install a rebuilt sink (producer-level settings changed); the old
    /// one is flushed before being dropped.
    pub fn set_output(&mut self, output: Arc<dyn Output>) {
        self.output.close();
        self.output = output;
    }

    /// A watcher with no reader, or one whose last successful read is older
    /// than the silence threshold, reports inactive; the manager retires it.
    pub fn is_active(&self) -> bool {
        let guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            None => false,
            Some(reader) => {
                reader.last_io_time().elapsed() <= Duration::from_millis(self.stat_silent_max_ms)
            }
        }
    }

    /// Snapshot for the per-host progress document.
    pub fn progress(&self) -> Progress {
        let guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(reader) => Progress {
                realpath: self.path.clone(),
                filepos: reader.file_pos() as i64,
                filesize: reader.file_size() as i64,
            },
            None => Progress {
                realpath: self.path.clone(),
                filepos: -1,
                filesize: 0,
            },
        }
    }
}
