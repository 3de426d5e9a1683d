//! Persistent state store
//!
//! The store is opened from a location string:
//!
//! - `mem:` keeps state in memory only
//! - `kube:<secret>` and `arn:<...>` name secret managers, which this build
//!   does not support
//! - anything else is a file path holding a JSON object, replaced atomically
//!   on every write

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Key under which preferences are stored
pub const PREFS_KEY: &str = "prefs";
/// Key under which the login flag is stored
pub const LOGIN_KEY: &str = "logged_in";

/// Opaque key/value persistence
pub trait StateStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>>;
    fn write(&self, key: &str, value: Value) -> Result<()>;
}

/// Read `key` and decode it as `T`
pub fn load<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.read(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encode `value` and write it under `key`
pub fn save<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    store.write(key, serde_json::to_value(value)?)
}

/// Open a store from its location string
pub fn open_store(location: &str) -> Result<Arc<dyn StateStore>> {
    if location == "mem:" {
        log::info!("Using in-memory state store");
        return Ok(Arc::new(MemStore::default()));
    }
    if location.starts_with("kube:") || location.starts_with("arn:") {
        return Err(Error::Unsupported(format!(
            "state store {:?} requires a secret manager",
            location
        )));
    }
    if location.is_empty() {
        return Err(Error::Config("state path is empty".into()));
    }
    Ok(Arc::new(FileStore::open(location)?))
}

/// Memory-only store
#[derive(Debug, Default)]
pub struct MemStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl StateStore for MemStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON file store
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let values = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Store(format!("{} is corrupt: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        log::info!("Using state file {}", path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if values.get(key) == Some(&value) {
            return Ok(());
        }
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *values = next;
        Ok(())
    }
}
