//! Persistence for the poll watermark.
//!
//! The watermark is the newest item timestamp the poller has reported. It is
//! stored as `{"watermark": <i64>}` so a restarted watcher does not report
//! the same items twice.

use handoff_core::watermark::WatermarkStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// On-disk form of the watermark.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PersistedWatermark {
    pub watermark: i64,
}

/// Watermark backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileWatermark {
    path: PathBuf,
}

impl FileWatermark {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> io::Result<PersistedWatermark> {
        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents).map_err(io::Error::from)
    }
}

impl WatermarkStore for FileWatermark {
    /// Missing or unreadable state counts as "nothing seen yet".
    fn load(&self) -> i64 {
        match self.read() {
            Ok(persisted) => persisted.watermark,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("Ignoring unreadable watermark file {:?}: {}", self.path, e);
                0
            }
        }
    }

    fn store(&self, watermark: i64) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&PersistedWatermark { watermark })?;
        fs::write(&self.path, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_zero() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileWatermark::new(temp_dir.path().join("state.json"));
        assert_eq!(store.load(), 0);
    }

    #[test]
    fn test_store_then_load_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/state.json");

        {
            let store = FileWatermark::new(path.clone());
            store.store(1_700_000_000_123).unwrap();
        }

        let store = FileWatermark::new(path.clone());
        assert_eq!(store.load(), 1_700_000_000_123);

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: PersistedWatermark = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.watermark, 1_700_000_000_123);
    }

    #[test]
    fn test_corrupt_file_loads_zero() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        assert_eq!(FileWatermark::new(path).load(), 0);
    }
}
