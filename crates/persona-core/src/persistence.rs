//! Local persistence: one serialized snapshot under a fixed key, one backup
//! slot, and a periodic autosave task.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::document::VERSION;
use crate::error::{PersonaError, Result};

const BACKUP_SUFFIX: &str = "_backup";

/// Raw key/value storage for snapshots.
pub trait SnapshotStore {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, data: &str) -> Result<()>;
    /// Returns whether anything was removed.
    fn remove(&self, key: &str) -> Result<bool>;
}

/// One `<key>.json` file per slot under a directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    fn write(&self, key: &str, data: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        // Atomic replace.
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, self.path(key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path(key);
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }
}

/// Process-local slots, for tests and ephemeral editors.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slots: RefCell<HashMap<String, String>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.slots.borrow().get(key).cloned())
    }

    fn write(&self, key: &str, data: &str) -> Result<()> {
        self.slots.borrow_mut().insert(key.to_string(), data.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.slots.borrow_mut().remove(key).is_some())
    }
}

/// What actually lands in a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: String,
    pub version: String,
    pub persona: Value,
}

/// Snapshot and backup slots for one storage key.
pub struct Persistence {
    backend: Box<dyn SnapshotStore>,
    key: String,
}

impl Persistence {
    pub fn new(backend: Box<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    pub fn in_memory(key: impl Into<String>) -> Self {
        Self::new(Box::<MemorySnapshotStore>::default(), key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn backup_key(&self) -> String {
        format!("{}{}", self.key, BACKUP_SUFFIX)
    }

    fn read_slot(&self, key: &str) -> Result<Option<Snapshot>> {
        match self.backend.read(key)? {
            Some(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| PersonaError::Parse(format!("Corrupt snapshot '{key}': {e}"))),
            None => Ok(None),
        }
    }

    /// Write `persona` to the main slot. Returns the save timestamp.
    pub fn save(&self, persona: &Value) -> Result<String> {
        let snapshot = Snapshot {
            saved_at: chrono::Utc::now().to_rfc3339(),
            version: VERSION.to_string(),
            persona: persona.clone(),
        };
        self.backend.write(&self.key, &serde_json::to_string(&snapshot)?)?;
        debug!("Snapshot saved under '{}'", self.key);
        Ok(snapshot.saved_at)
    }

    pub fn load(&self) -> Result<Option<Value>> {
        Ok(self.read_slot(&self.key)?.map(|s| s.persona))
    }

    pub fn last_saved(&self) -> Result<Option<String>> {
        Ok(self.read_slot(&self.key)?.map(|s| s.saved_at))
    }

    /// Copy the main slot into the backup slot. `false` if there is nothing to back up.
    pub fn create_backup(&self) -> Result<bool> {
        let Some(data) = self.backend.read(&self.key)? else {
            return Ok(false);
        };
        self.backend.write(&self.backup_key(), &data)?;
        info!("Backup created for '{}'", self.key);
        Ok(true)
    }

    pub fn has_backup(&self) -> Result<bool> {
        Ok(self.backend.read(&self.backup_key())?.is_some())
    }

    /// The persona held in the backup slot. The main slot is not touched.
    pub fn backup(&self) -> Result<Option<Value>> {
        Ok(self.read_slot(&self.backup_key())?.map(|s| s.persona))
    }

    /// Remove both slots.
    pub fn clear(&self) -> Result<()> {
        self.backend.remove(&self.key)?;
        self.backend.remove(&self.backup_key())?;
        info!("Storage cleared for '{}'", self.key);
        Ok(())
    }
}

// ── Autosave ──

/// A running autosave task. Aborted on [`stop`](Self::stop) or drop.
pub struct AutoSaver {
    handle: Option<JoinHandle<()>>,
}

impl AutoSaver {
    /// Run `save` every `period` on the current `LocalSet`, first tick one
    /// period from now. Failures are logged and the timer keeps going.
    pub fn spawn<F>(period: Duration, save: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + 'static,
    {
        let handle = tokio::task::spawn_local(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = save() {
                    error!("Autosave failed: {}", e);
                }
            }
        });
        info!("Autosave every {}s", period.as_secs());
        Self {
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Autosave stopped");
        }
    }
}

impl Drop for AutoSaver {
    fn drop(&mut self) {
        self.stop();
    }
}
