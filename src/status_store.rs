//! Durable record of every asset's progress, kept as one JSON document keyed by
//! `"{scene_id}:{asset_type}"`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{StoreError, TransitionError};
use crate::record::{AssetKey, AssetRecord};

pub type StatusMap = BTreeMap<String, AssetRecord>;

pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is a first run. An unreadable one is fatal: discarding it
    /// would re-request activations for everything it tracked.
    pub fn load(self: &Self) -> Result<StatusMap, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StatusMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Err(self.corrupt("file is empty".to_string()));
        }

        let map: StatusMap =
            serde_json::from_str(&content).map_err(|e| self.corrupt(e.to_string()))?;

        for (key, record) in map.iter() {
            if AssetKey::parse(key).as_ref() != Some(&record.key()) {
                return Err(self.corrupt(format!(
                    "entry '{}' holds the record for '{}'",
                    key,
                    record.key()
                )));
            }
        }
        Ok(map)
    }

    /// Whole-file replace through a temp file in the same directory, so readers
    /// only ever see the previous or the new document.
    pub fn save(self: &Self, map: &StatusMap) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let content = serde_json::to_string_pretty(map)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    /// Read, merge one record, persist. The stored record, if any, must be able to
    /// reach the new record's state, and terminal records are never rewritten.
    pub fn upsert(&self, record: &AssetRecord) -> Result<(), StoreError> {
        let mut map = self.load()?;
        let key = record.key();

        if let Some(existing) = map.get(&key.to_string()) {
            if existing == record {
                return Ok(());
            }
            if existing.is_terminal() {
                return Err(TransitionError::Terminal {
                    key: key.to_string(),
                    state: existing.state,
                }
                .into());
            }
            if !existing.state.can_move_to(record.state) {
                return Err(TransitionError::Illegal {
                    key: key.to_string(),
                    from: existing.state,
                    to: record.state,
                }
                .into());
            }
        }

        map.insert(key.to_string(), record.clone());
        self.save(&map)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }
}
