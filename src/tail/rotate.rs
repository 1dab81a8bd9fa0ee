// SPDX-License-Identifier: Apache-2.0

//! Rotation detection for a single watched path.
//!
//! A path stops representing its log stream in three ways: the inode
//! changes (rename + recreate), the file disappears, or the size shrinks in
//! place (truncation). The detector stats the path once per tick and, when
//! one of those holds, opens the path fresh and yields the owning handle to
//! its caller, which either binds it into a reader or drops it.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::tail::position::INO_NONE;

pub struct RotateDetector {
    path: PathBuf,
    last_ino: u64,
    last_size: i64,
}

impl RotateDetector {
    /// `last_size` starts below any real size so the first successful stat
    /// of an existing file fires (the watcher needs an initial handle).
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_ino: INO_NONE,
            last_size: -1,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stat the path and return a freshly opened handle if the file's
    /// identity changed or it was truncated since the last observation.
    ///
    /// If the open fails after a change was detected, the last observation
    /// is left untouched so the next tick retries.
    pub fn check(&mut self) -> Option<File> {
        let (ino, size) = match fs::metadata(&self.path) {
            Ok(md) => (md.ino(), md.len() as i64),
            Err(_) => (INO_NONE, 0),
        };

        let mut opened = None;
        if ino != self.last_ino || size < self.last_size {
            match File::open(&self.path) {
                Ok(file) => opened = Some(file),
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "failed to open rotated file");
                    return None;
                }
            }
        }

        self.last_ino = ino;
        self.last_size = size;

        opened
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fires_on_first_sight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"hello\n").unwrap();

        let mut det = RotateDetector::new(&path);
        assert!(det.check().is_some());

        // Same inode, same size: quiet.
        assert!(det.check().is_none());
    }

    #[test]
    fn quiet_while_growing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"one\n").unwrap();

        let mut det = RotateDetector::new(&path);
        assert!(det.check().is_some());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"two\n").unwrap();
        drop(f);

        // Growth is new data, not rotation.
        assert!(det.check().is_none());
    }

    #[test]
    fn fires_on_rename_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"old old old\n").unwrap();

        let mut det = RotateDetector::new(&path);
        assert!(det.check().is_some());

        fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        fs::write(&path, b"new\n").unwrap();

        assert!(det.check().is_some());
    }

    #[test]
    fn fires_on_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"aaa\nbbb\n").unwrap();

        let mut det = RotateDetector::new(&path);
        assert!(det.check().is_some());

        let f = fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(0).unwrap();
        drop(f);

        assert!(det.check().is_some());
    }

    #[test]
    fn retries_while_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");

        let mut det = RotateDetector::new(&path);

        // Nothing there yet: no handle, no state change.
        assert!(det.check().is_none());
        assert!(det.check().is_none());

        fs::write(&path, b"first\n").unwrap();
        assert!(det.check().is_some());
    }

    #[test]
    fn fires_when_file_reappears_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, b"gone soon\n").unwrap();

        let mut det = RotateDetector::new(&path);
        assert!(det.check().is_some());

        // Deletion: the open fails, so the detector keeps its last
        // observation and keeps retrying.
        fs::remove_file(&path).unwrap();
        assert!(det.check().is_none());
        assert!(det.check().is_none());

        fs::write(&path, b"back\n").unwrap();
        assert!(det.check().is_some());
    }
}
