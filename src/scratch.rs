//! Scratch directory lifecycle.
//!
//! Generated images, the narration track, and intermediate clips all live in
//! one scratch directory. It is cleaned proactively before a run (leftovers
//! from an interrupted prior run), cleaned again after a successful run, and
//! purged by an age/size cap independent of any single run.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::Result;

pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: root.unwrap_or_else(default_root),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove leftovers from interrupted prior runs and recreate the
    /// directory empty.
    pub fn prepare(&self) -> Result<()> {
        self.clear("preparing scratch directory")
    }

    /// Remove this run's artifacts after a successful render.
    pub fn cleanup(&self) -> Result<()> {
        self.clear("cleaning scratch directory")
    }

    fn clear(&self, action: &str) -> Result<()> {
        if self.root.exists() {
            let (files, bytes) = usage(&self.root)?;
            if files > 0 {
                tracing::info!(files, mb = bytes / (1024 * 1024), "{action}");
            }
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Enforce the age and size caps: entries older than `max_age` go first,
    /// then oldest-first removal until the total drops under `max_bytes`.
    pub fn purge(&self, max_age: Duration, max_bytes: u64) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let now = SystemTime::now();
        let mut entries: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(now);
            entries.push((entry.path(), modified, metadata.len()));
        }

        let mut removed = 0usize;
        entries.retain(|(path, modified, _)| {
            let stale = now
                .duration_since(*modified)
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale {
                if std::fs::remove_file(path).is_ok() {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });

        let mut total: u64 = entries.iter().map(|(_, _, len)| len).sum();
        if total > max_bytes {
            // Oldest first.
            entries.sort_by_key(|(_, modified, _)| *modified);
            for (path, _, len) in entries {
                if total <= max_bytes {
                    break;
                }
                if std::fs::remove_file(&path).is_ok() {
                    total -= len;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "purged scratch entries");
        }
        Ok(())
    }
}

fn usage(root: &Path) -> Result<(usize, u64)> {
    let mut files = 0usize;
    let mut bytes = 0u64;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("shortsmith/scratch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn prepare_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(Some(dir.path().join("scratch")));
        fs::create_dir_all(scratch.path()).unwrap();
        fs::write(scratch.file("scene_0.png"), b"stale").unwrap();

        scratch.prepare().unwrap();
        assert!(scratch.path().exists());
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn purge_enforces_the_size_cap_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(Some(dir.path().join("scratch")));
        scratch.prepare().unwrap();

        let old = scratch.file("old.bin");
        let new = scratch.file("new.bin");
        fs::write(&old, vec![0u8; 64]).unwrap();
        // Make `old` visibly older than `new`.
        let earlier = SystemTime::now() - Duration::from_secs(3600);
        filetime_set(&old, earlier);
        fs::write(&new, vec![0u8; 64]).unwrap();

        scratch.purge(Duration::from_secs(86_400), 100).unwrap();
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[test]
    fn purge_enforces_the_age_cap() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(Some(dir.path().join("scratch")));
        scratch.prepare().unwrap();

        let stale = scratch.file("stale.bin");
        fs::write(&stale, b"x").unwrap();
        filetime_set(&stale, SystemTime::now() - Duration::from_secs(7200));

        scratch.purge(Duration::from_secs(3600), u64::MAX).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn purge_on_a_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(Some(dir.path().join("never-created")));
        scratch
            .purge(Duration::from_secs(1), 1)
            .expect("missing directory must not error");
    }

    /// Set a file's modification time without an extra dependency.
    fn filetime_set(path: &Path, to: SystemTime) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(to).unwrap();
    }
}
