// SPDX-License-Identifier: Apache-2.0

//! Durable read-position store with atomic writes.
//!
//! The store is one JSON document mapping watched paths to their last
//! checkpointed `(inode, offset)`. Every mutation writes through to disk
//! with a write-to-temp-then-rename so a crash between two updates never
//! loses a previously acknowledged checkpoint.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::tail::error::{Error, Result};

/// Sentinel inode for a path that has never been opened.
pub const INO_NONE: u64 = 0;

/// A checkpointed read position for one watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Inode of the file the offset refers to, or [`INO_NONE`].
    pub ino: u64,
    /// Byte offset immediately past the last fully delivered line.
    pub offset: u64,
}

impl Position {
    pub fn none() -> Self {
        Self {
            ino: INO_NONE,
            offset: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    entries: HashMap<String, Position>,
}

/// Shared handle to the on-disk position store.
#[derive(Clone)]
pub struct PositionFile {
    path: PathBuf,
    state: Arc<RwLock<StoreState>>,
}

impl PositionFile {
    /// Open or create the store at the given path. Failure here is fatal to
    /// the daemon; the caller exits rather than tailing without checkpoints.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| Error::Position(format!("failed to open position file: {}", e)))?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)
                .map_err(|e| Error::Position(format!("failed to parse position file: {}", e)))?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(|e| {
                        Error::Position(format!("failed to create position directory: {}", e))
                    })?;
                }
            }
            StoreState::default()
        };

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Last checkpoint for a path, or the never-opened sentinel.
    pub fn get(&self, key: &str) -> Position {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
            .copied()
            .unwrap_or_else(Position::none)
    }

    /// Set both inode and offset for a path and persist.
    pub fn update(&self, key: &str, ino: u64, offset: u64) -> Result<()> {
        self.mutate(key, Position { ino, offset })
    }

    /// Update only the offset for a path and persist. The inode stays at
    /// its last value (or the sentinel if the key is new).
    pub fn update_pos(&self, key: &str, offset: u64) -> Result<()> {
        let ino = self.get(key).ino;
        self.mutate(key, Position { ino, offset })
    }

    fn mutate(&self, key: &str, pos: Position) -> Result<()> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|e| Error::Position(e.to_string()))?;
            state.entries.insert(key.to_string(), pos);
        }
        self.sync()
    }

    fn sync(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(()); // in-memory mode
        }

        let state = self
            .state
            .read()
            .map_err(|e| Error::Position(e.to_string()))?;

        atomic_write(&self.path, &state)
    }
}

/// Write state to file atomically (write to temp, then rename)
fn atomic_write(path: &Path, state: &StoreState) -> Result<()> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    // Unique temp name so two stores (or a test race) never step on each
    // other's in-flight write.
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Position(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state)
        .map_err(|e| Error::Position(format!("failed to write position file: {}", e)))?;

    writer
        .flush()
        .map_err(|e| Error::Position(format!("failed to flush position file: {}", e)))?;
    drop(writer);

    // Rename temp to final (atomic on most filesystems)
    fs::rename(&temp_path, path)
        .map_err(|e| Error::Position(format!("failed to rename position file: {}", e)))?;

    Ok(())
}

/// A read-position record handed to watchers and readers.
///
/// `Durable` writes every mutation through to the [`PositionFile`] under its
/// key. `Memory` is a free-standing `(inode, offset)` used while a reader
/// drains an outgoing file during rotation hand-off; it is discarded with
/// the reader.
#[derive(Clone)]
pub enum PositionEntry {
    Durable { store: PositionFile, key: String },
    Memory { pos: Position },
}

impl PositionEntry {
    pub fn durable(store: PositionFile, key: impl Into<String>) -> SharedPositionEntry {
        Arc::new(Mutex::new(PositionEntry::Durable {
            store,
            key: key.into(),
        }))
    }

    pub fn memory(ino: u64, offset: u64) -> SharedPositionEntry {
        Arc::new(Mutex::new(PositionEntry::Memory {
            pos: Position { ino, offset },
        }))
    }

    pub fn read(&self) -> Position {
        match self {
            PositionEntry::Durable { store, key } => store.get(key),
            PositionEntry::Memory { pos } => *pos,
        }
    }

    pub fn read_inode(&self) -> u64 {
        self.read().ino
    }

    pub fn read_pos(&self) -> u64 {
        self.read().offset
    }

    pub fn update(&mut self, ino: u64, offset: u64) -> Result<()> {
        match self {
            PositionEntry::Durable { store, key } => store.update(key, ino, offset),
            PositionEntry::Memory { pos } => {
                *pos = Position { ino, offset };
                Ok(())
            }
        }
    }

    pub fn update_pos(&mut self, offset: u64) -> Result<()> {
        match self {
            PositionEntry::Durable { store, key } => store.update_pos(key, offset),
            PositionEntry::Memory { pos } => {
                pos.offset = offset;
                Ok(())
            }
        }
    }
}

/// Shared between a watcher and its current reader; the rotate hand-off
/// swaps the contents while both sides keep their handles.
pub type SharedPositionEntry = Arc<Mutex<PositionEntry>>;

/// Detach the durable entry from a shared handle, leaving behind a `Memory`
/// entry seeded with the current checkpoint.
///
/// The outgoing reader keeps draining against the in-memory copy while the
/// returned durable entry moves to the watcher taking over the path.
pub fn swap_to_memory(shared: &SharedPositionEntry) -> SharedPositionEntry {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let snapshot = guard.read();
    let detached = std::mem::replace(&mut *guard, PositionEntry::Memory { pos: snapshot });
    Arc::new(Mutex::new(detached))
}

/// Convenience accessors that take the entry lock.
pub fn entry_position(shared: &SharedPositionEntry) -> Position {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .read()
}

pub fn entry_update(shared: &SharedPositionEntry, ino: u64, offset: u64) -> Result<()> {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .update(ino, offset)
}

pub fn entry_update_pos(shared: &SharedPositionEntry, offset: u64) -> Result<()> {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .update_pos(offset)
}
