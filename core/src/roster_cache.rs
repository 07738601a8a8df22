/// On-disk roster cache: `<data_dir>/roster.json`
///
/// Replayed at start-up before the first fetch returns. The file carries no
/// ordering metadata, so its rows are merged with the never-decrease rule.
use crate::error::{Result, SyncError};
use crate::types::SnapshotPeer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const ROSTER_FILE: &str = "roster.json";
const CACHE_VERSION: u8 = 1;
const MAX_CACHED_PEERS: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RosterFileV1 {
    version: u8,
    saved_at: DateTime<Utc>,
    peers: Vec<SnapshotPeer>,
}

#[derive(Debug, Clone)]
pub struct RosterCache {
    path: PathBuf,
}

impl RosterCache {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(ROSTER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cached rows. A missing file is an empty roster.
    pub fn load(&self) -> Result<Vec<SnapshotPeer>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let parsed: RosterFileV1 = serde_json::from_str(&raw)?;
        if parsed.version != CACHE_VERSION {
            return Err(SyncError::Config(format!(
                "Unsupported roster cache version: {}",
                parsed.version
            )));
        }
        Ok(parsed.peers)
    }

    /// Persist rows, keeping the first `MAX_CACHED_PEERS`
    pub fn save(&self, peers: &[SnapshotPeer]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = RosterFileV1 {
            version: CACHE_VERSION,
            saved_at: Utc::now(),
            peers: peers.iter().take(MAX_CACHED_PEERS).cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        // Readers never see a partially written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = RosterCache::new(temp_dir.path());
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let cache = RosterCache::new(&temp_dir.path().join("nested"));
        let rows = vec![
            SnapshotPeer::new("a", "Alice", 2),
            SnapshotPeer {
                id: "z".into(),
                display_name: None,
                unseen: 1,
            },
        ];

        cache.save(&rows).unwrap();
        assert_eq!(cache.load().unwrap(), rows);
        assert!(!cache.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let temp_dir = TempDir::new().unwrap();
        let cache = RosterCache::new(temp_dir.path());
        fs::write(
            cache.path(),
            r#"{"version":9,"saved_at":"2024-01-01T00:00:00Z","peers":[]}"#,
        )
        .unwrap();
        assert!(matches!(cache.load(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let cache = RosterCache::new(temp_dir.path());
        fs::write(cache.path(), "{ not json").unwrap();
        assert!(matches!(cache.load(), Err(SyncError::Serialization(_))));
    }
}
