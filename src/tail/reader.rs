// SPDX-License-Identifier: Apache-2.0

//! Bounded line reading from an open file handle.
//!
//! One `drain` call per tick: seek to the checkpoint, read at most
//! `max_lines_per_tick` newline-terminated lines, hand each to the output,
//! and advance the checkpoint past the last line the output accepted. A
//! partial trailing line stays in the file for a later tick; an over-long
//! line is delivered truncated and counted, never dropped silently.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::warn;

use crate::exporters::{Output, PushOutcome};
use crate::tail::error::Result;
use crate::tail::position::{entry_position, entry_update_pos, SharedPositionEntry};

pub struct IoReader {
    /// The open handle; `None` once closed. All operations on a closed
    /// reader are no-ops.
    file: Option<File>,
    entry: SharedPositionEntry,
    max_lines_per_tick: usize,
    line_max_bytes: usize,
    last_io_time: Instant,
    truncated_lines: AtomicU64,
    /// Reusable line buffer to avoid allocations
    buf: Vec<u8>,
}

impl IoReader {
    pub fn new(
        file: File,
        entry: SharedPositionEntry,
        max_lines_per_tick: usize,
        line_max_bytes: usize,
    ) -> Self {
        Self {
            file: Some(file),
            entry,
            max_lines_per_tick,
            line_max_bytes,
            last_io_time: Instant::now(),
            truncated_lines: AtomicU64::new(0),
            buf: Vec::with_capacity(1024),
        }
    }

    /// Replace the position entry this reader checkpoints against. Used by
    /// the rotation hand-off to repoint a draining reader at an in-memory
    /// entry.
    pub fn set_entry(&mut self, entry: SharedPositionEntry) {
        self.entry = entry;
    }

    /// Hot-swap the per-tick line bound when the task config changes.
    pub fn set_max_lines_per_tick(&mut self, max_lines_per_tick: usize) {
        self.max_lines_per_tick = max_lines_per_tick;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Checkpointed read position.
    pub fn file_pos(&self) -> u64 {
        entry_position(&self.entry).offset
    }

    /// Size of the underlying file, 0 once closed.
    pub fn file_size(&self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|md| md.len())
            .unwrap_or(0)
    }

    /// Time of the most recent non-empty read (reader creation before any).
    pub fn last_io_time(&self) -> Instant {
        self.last_io_time
    }

    /// Lines delivered truncated because they exceeded the per-line cap.
    pub fn truncated_lines(&self) -> u64 {
        self.truncated_lines.load(Ordering::Relaxed)
    }

    /// Read and deliver newly appended lines, returning how many the output
    /// accepted. The checkpoint ends up immediately past the last accepted
    /// line; a rejected line and everything after it is re-read next tick.
    pub fn drain(&mut self, output: &dyn Output, topic: &str, key: Option<&str>) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let start = entry_position(&self.entry).offset;
        file.seek(SeekFrom::Start(start))?;
        let mut reader = BufReader::new(&mut *file);

        let mut pos = start;
        let mut delivered = 0usize;

        while delivered < self.max_lines_per_tick {
            self.buf.clear();
            let n = reader.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                break;
            }
            if self.buf.last() != Some(&b'\n') {
                // Partial trailing line: leave its bytes for a later tick.
                break;
            }

            let mut line = &self.buf[..self.buf.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            let payload = if line.len() > self.line_max_bytes {
                let count = self.truncated_lines.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    topic,
                    line_bytes = line.len(),
                    cap = self.line_max_bytes,
                    truncated_total = count,
                    "line exceeds cap, delivering truncated"
                );
                &line[..self.line_max_bytes]
            } else {
                line
            };

            match output.push(topic, key, payload) {
                PushOutcome::Accepted => {
                    pos += n as u64;
                    delivered += 1;
                }
                PushOutcome::Rejected => break,
            }
        }

        if delivered > 0 {
            self.last_io_time = Instant::now();
            entry_update_pos(&self.entry, pos)?;
        }

        Ok(delivered)
    }

    /// Release the handle; subsequent operations are safe no-ops.
    pub fn close(&mut self) {
        self.file = None;
    }
}
