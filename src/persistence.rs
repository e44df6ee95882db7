//! Snapshot persistence
//!
//! The engine writes a full `BotState` snapshot after every state change. A
//! store must replace the previous snapshot atomically and refuse to go
//! backwards in sequence.

use crate::config::{PersistenceConfig, StoreBackend};
use crate::core::bot_state::BotState;
use crate::db::SqliteStateStore;
use crate::error::{GridBotError, GridBotResult};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

pub trait StateStore: Send {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load_state(&self) -> GridBotResult<Option<BotState>>;

    /// Fails with `StaleSnapshot` unless `state.sequence` is greater than the
    /// stored one.
    fn save_state(&self, state: &BotState) -> GridBotResult<()>;

    fn describe(&self) -> String;
}

impl<T: StateStore + ?Sized> StateStore for Box<T> {
    fn load_state(&self) -> GridBotResult<Option<BotState>> {
        (**self).load_state()
    }

    fn save_state(&self, state: &BotState) -> GridBotResult<()> {
        (**self).save_state(state)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Open the store selected by the configuration.
pub fn open_store(config: &PersistenceConfig) -> GridBotResult<Box<dyn StateStore>> {
    match config.backend {
        StoreBackend::Json => Ok(Box::new(JsonFileStore::new(&config.path))),
        StoreBackend::Sqlite => Ok(Box::new(SqliteStateStore::open(&config.path)?)),
    }
}

/// JSON snapshot on disk, replaced with write-temp, fsync, rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    last_sequence: Mutex<Option<u64>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_sequence: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn read(&self) -> GridBotResult<Option<BotState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let state: BotState = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    fn stored_sequence(&self) -> GridBotResult<Option<u64>> {
        let mut cached = self
            .last_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cached.is_none() {
            *cached = self.read()?.map(|s| s.sequence);
        }
        Ok(*cached)
    }

    fn remember(&self, sequence: u64) {
        let mut cached = self
            .last_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = Some(sequence);
    }
}

impl StateStore for JsonFileStore {
    fn load_state(&self) -> GridBotResult<Option<BotState>> {
        let state = self.read()?;
        if let Some(state) = &state {
            self.remember(state.sequence);
        }
        Ok(state)
    }

    fn save_state(&self, state: &BotState) -> GridBotResult<()> {
        if let Some(stored) = self.stored_sequence()? {
            if state.sequence <= stored {
                return Err(GridBotError::StaleSnapshot {
                    attempted: state.sequence,
                    stored,
                });
            }
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let payload = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        // Make the rename durable
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.remember(state.sequence);
        debug!(sequence = state.sequence, path = %self.path.display(), "state snapshot written");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}
