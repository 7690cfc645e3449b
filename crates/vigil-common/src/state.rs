//! Durable agent state, persisted as a single JSON document.
//!
//! The document is a `{key -> opaque json}` map. Two keys are reserved for
//! the agent identity (`agent_uuid` and `password`); every other key belongs
//! to the component that writes it. Writes go to `<path>.tmp` with mode
//! 0600, are fsynced, then renamed over the previous file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state: {0}")]
    Io(#[from] std::io::Error),
    #[error("state: invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// The agent state file.
pub struct State {
    path: PathBuf,
    data: Mutex<HashMap<String, Box<RawValue>>>,
}

impl State {
    /// Load the state file, returning an empty state when the file does not
    /// exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<State> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(State {
            path,
            data: Mutex::new(data),
        })
    }

    /// Write the full document atomically.
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        self.save_locked(&data)
    }

    fn save_locked(&self, data: &HashMap<String, Box<RawValue>>) -> Result<()> {
        let tmp_path = {
            let mut p = self.path.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp_path)?;
            let buffer = serde_json::to_vec(data)?;
            file.write_all(&buffer)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Store an object under `key` and persist immediately. A failure to
    /// write the file is logged but does not fail the caller, matching the
    /// contract that only startup writability is fatal.
    pub fn set<T: Serialize>(&self, key: &str, object: &T) -> Result<()> {
        let raw = serde_json::value::to_raw_value(object)?;
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), raw);
        if let Err(err) = self.save_locked(&data) {
            tracing::warn!(path = %self.path.display(), error = %err, "unable to save state file");
        }
        Ok(())
    }

    /// Fetch the object stored under `key`. Returns `None` when the key is
    /// absent or does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().unwrap();
        let raw = data.get(key)?;
        match serde_json::from_str(raw.get()) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::debug!(key, error = %err, "discarding undecodable state entry");
                None
            }
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.remove(key).is_none() {
            return Ok(());
        }
        if let Err(err) = self.save_locked(&data) {
            tracing::warn!(path = %self.path.display(), error = %err, "unable to save state file");
        }
        Ok(())
    }
}
