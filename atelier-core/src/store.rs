//! On-disk presence of model artifacts.
//!
//! The store keeps no state of its own: every query looks at the filesystem.
//! A model is present when its directory exists and holds at least one entry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Absent,
    Downloading,
    Present,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    base_dir: PathBuf,
}

impl ModelStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn directory_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    pub fn is_present(&self, key: &str) -> bool {
        fs::read_dir(self.directory_for(key))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    pub fn state(&self, key: &str) -> DiskState {
        if self.is_present(key) {
            DiskState::Present
        } else {
            DiskState::Absent
        }
    }

    /// Removes the model directory recursively.
    ///
    /// Fails with `ErrorKind::NotFound` when there is nothing to remove.
    pub fn delete(&self, key: &str) -> io::Result<()> {
        fs::remove_dir_all(self.directory_for(key))
    }

    /// Total bytes under the model directory, 0 when absent.
    pub fn size_on_disk(&self, key: &str) -> u64 {
        dir_size(&self.directory_for(key)).unwrap_or(0)
    }
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        // hf-hub snapshots are symlinks into blobs/, count the blobs only
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_missing_directory_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path());
        assert!(!store.is_present("flux-schnell"));

        fs::create_dir_all(store.directory_for("flux-schnell")).unwrap();
        assert_eq!(store.state("flux-schnell"), DiskState::Absent);

        fs::write(store.directory_for("flux-schnell").join("ae.safetensors"), b"abc").unwrap();
        assert_eq!(store.state("flux-schnell"), DiskState::Present);
        assert_eq!(store.size_on_disk("flux-schnell"), 3);
    }

    #[test]
    fn directory_layout_is_one_dir_per_key() {
        let store = ModelStore::new("/srv/models");
        assert_eq!(store.directory_for("sdxl"), PathBuf::from("/srv/models/sdxl"));
    }

    #[test]
    fn delete_missing_reports_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path());
        let err = store.delete("sdxl").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let nested = store.directory_for("sdxl").join("unet");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("weights.safetensors"), b"0123").unwrap();
        store.delete("sdxl").unwrap();
        assert!(!store.is_present("sdxl"));
    }
}
