//! State that survives process restarts.
//!
//! Only the last volume setting is kept. It is read once at startup and
//! written back on every absolute volume change.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct State {
    pub last_volume: u8,
}

/// File-backed persisted state.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    state: Mutex<State>,
}

impl Store {
    /// Opens the state file at `path`.
    ///
    /// A missing file is not an error: the store starts out with
    /// `default_volume` and creates the file on the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open<P: Into<PathBuf>>(path: P, default_volume: u8) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no persisted state at {}", path.display());
                State {
                    last_volume: default_volume,
                }
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last persisted volume in percent.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the state lock is poisoned.
    pub fn last_volume(&self) -> Result<u8> {
        Ok(self.state.lock()?.last_volume)
    }

    /// Persists a new volume, skipping the write if it did not change.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn set_last_volume(&self, volume: u8) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.last_volume == volume && self.path.exists() {
            return Ok(());
        }

        let mut new_state = *state;
        new_state.last_volume = volume;
        fs::write(&self.path, toml::to_string(&new_state)?)?;
        *state = new_state;

        trace!("persisted volume {volume}%");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_default_volume() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state.toml"), 70).unwrap();
        assert_eq!(store.last_volume().unwrap(), 70);
        assert!(!store.path().exists());
    }

    #[test]
    fn volume_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");

        let store = Store::open(&path, 100).unwrap();
        store.set_last_volume(35).unwrap();
        drop(store);

        let store = Store::open(&path, 100).unwrap();
        assert_eq!(store.last_volume().unwrap(), 35);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "last_volume = \"loud\"").unwrap();
        assert!(Store::open(&path, 100).is_err());
    }
}
