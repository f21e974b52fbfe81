//! File-backed key-value store and the reboot counter kept in it.
//!
//! The store mirrors the settings partition of the embedded build: a flat
//! map of string keys to opaque byte blobs, flushed to a JSON file. The
//! Matter runtime keeps its own persistence (`Psm`); this store holds the
//! crate's side state (diagnostics counters, calibration overrides) and is
//! the erase target of the factory wipe.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::fabric::services::KeyValueStore;
use crate::fabric::types::FabricError;

/// Settings key of the persistent reboot counter.
pub const REBOOT_COUNT_KEY: &str = "soil.gendiag.rebootcnt";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PersistedSettings {
    entries: BTreeMap<String, Vec<u8>>,
}

impl PersistedSettings {
    fn load(path: &PathBuf) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedSettings>(&bytes) {
                Ok(state) => {
                    info!("Loaded {} settings entries from {:?}", state.entries.len(), path);
                    state
                }
                Err(e) => {
                    warn!("Failed to parse settings file, starting empty: {}", e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings file found (first run)");
                Self::default()
            }
            Err(e) => {
                error!("Failed to read settings file: {}", e);
                Self::default()
            }
        }
    }

    fn save(&self, path: &PathBuf) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

/// Key-value store persisted to a JSON file, or purely in-memory for tests.
pub struct FileKvStore {
    path: Option<PathBuf>,
    state: RwLock<PersistedSettings>,
}

impl FileKvStore {
    pub fn new(path: PathBuf) -> Arc<Self> {
        let state = PersistedSettings::load(&path);
        Arc::new(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// Store with no backing file. `flush` is a no-op.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            state: RwLock::new(PersistedSettings::default()),
        })
    }

    fn save_locked(&self, state: &PersistedSettings) -> Result<(), FabricError> {
        if let Some(path) = &self.path {
            state
                .save(path)
                .map_err(|e| FabricError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().entries.get(key).cloned()
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), FabricError> {
        let mut state = self.state.write();
        state.entries.insert(key.to_string(), value.to_vec());
        self.save_locked(&state)
    }

    fn delete(&self, key: &str) -> Result<(), FabricError> {
        let mut state = self.state.write();
        state.entries.remove(key);
        self.save_locked(&state)
    }

    fn factory_reset(&self) -> Result<(), FabricError> {
        let mut state = self.state.write();
        state.entries.clear();
        info!("Settings store erased");
        self.save_locked(&state)
    }

    fn flush(&self) -> Result<(), FabricError> {
        let state = self.state.read();
        self.save_locked(&state)
    }
}

/// Increment and persist the reboot counter, returning the new count.
///
/// Counts from 1 on the first boot after a wipe. A corrupt value is
/// treated as absent rather than failing the boot.
pub fn bump_reboot_count(store: &dyn KeyValueStore) -> Result<u16, FabricError> {
    let current = store
        .get(REBOOT_COUNT_KEY)
        .and_then(|bytes| <[u8; 2]>::try_from(bytes.as_slice()).ok())
        .map(u16::from_le_bytes)
        .unwrap_or(0);

    let next = current.wrapping_add(1);
    store.put(REBOOT_COUNT_KEY, &next.to_le_bytes())?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reboot_count_starts_at_one_and_increments() {
        let store = FileKvStore::in_memory();
        assert_eq!(bump_reboot_count(store.as_ref()).unwrap(), 1);
        assert_eq!(bump_reboot_count(store.as_ref()).unwrap(), 2);
        assert_eq!(bump_reboot_count(store.as_ref()).unwrap(), 3);
    }

    #[test]
    fn corrupt_counter_restarts_from_one() {
        let store = FileKvStore::in_memory();
        store.put(REBOOT_COUNT_KEY, &[1, 2, 3]).unwrap();
        assert_eq!(bump_reboot_count(store.as_ref()).unwrap(), 1);
    }

    #[test]
    fn factory_reset_erases_the_counter() {
        let store = FileKvStore::in_memory();
        bump_reboot_count(store.as_ref()).unwrap();
        store.factory_reset().unwrap();
        assert!(store.get(REBOOT_COUNT_KEY).is_none());
        assert_eq!(bump_reboot_count(store.as_ref()).unwrap(), 1);
    }

    #[test]
    fn file_store_round_trips_across_reload() {
        let dir = std::env::temp_dir().join(format!("soil-kv-test-{}", std::process::id()));
        let path = dir.join("settings.json");

        {
            let store = FileKvStore::new(path.clone());
            store.put("a", &[1, 2]).unwrap();
            store.put("b", &[3]).unwrap();
            store.delete("b").unwrap();
        }

        let store = FileKvStore::new(path);
        assert_eq!(store.get("a"), Some(vec![1, 2]));
        assert!(store.get("b").is_none());

        let _ = fs::remove_dir_all(dir);
    }
}
