//! File-backed persistence for event id counters.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::trace;
use wdm_core::{CounterError, CounterStore};

/// Counter values kept as a JSON object in one file.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// original, so a crash leaves either the old or the new values. Clones
/// address the same file; tiers each get one.
#[derive(Debug, Clone)]
pub struct FileCounterStore {
    path: PathBuf,
}

impl FileCounterStore {
    /// Store backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, u64>, String> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| e.to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn write_all(&self, values: &BTreeMap<String, u64>) -> Result<(), String> {
        let encoded = serde_json::to_vec_pretty(values).map_err(|e| e.to_string())?;
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| e.to_string())?;
        file.write_all(&encoded).map_err(|e| e.to_string())?;
        file.sync_all().map_err(|e| e.to_string())?;
        fs::rename(&tmp, &self.path).map_err(|e| e.to_string())
    }
}

impl CounterStore for FileCounterStore {
    fn load(&self, key: &str) -> Result<Option<u64>, CounterError> {
        let values = self.read_all().map_err(|reason| CounterError::Load {
            key: key.to_string(),
            reason,
        })?;
        Ok(values.get(key).copied())
    }

    fn store(&mut self, key: &str, value: u64) -> Result<(), CounterError> {
        let to_store_error = |reason| CounterError::Store {
            key: key.to_string(),
            reason,
        };
        let mut values = self.read_all().map_err(to_store_error)?;
        values.insert(key.to_string(), value);
        self.write_all(&values).map_err(to_store_error)?;
        trace!(key, value, path = %self.path.display(), "counter stored");
        Ok(())
    }
}
