// String key/value storage for cached decryption authorizations
//
// In a browser this is IndexedDB/localStorage; here it is either process memory or a
// JSON file so separate CLI invocations reuse the same signed authorization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{GlucoseCheckError, GlucoseCheckResult};

/// Minimal string store used by the authorization cache
pub trait GenericStringStorage: Send + Sync {
    fn get_item(&self, key: &str) -> GlucoseCheckResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> GlucoseCheckResult<()>;
    fn remove_item(&self, key: &str) -> GlucoseCheckResult<()>;
}

/// Process-local storage
#[derive(Debug, Default)]
pub struct InMemoryStringStorage {
    items: RwLock<BTreeMap<String, String>>,
}

impl InMemoryStringStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl GenericStringStorage for InMemoryStringStorage {
    fn get_item(&self, key: &str) -> GlucoseCheckResult<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> GlucoseCheckResult<()> {
        self.items.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> GlucoseCheckResult<()> {
        self.items.write().remove(key);
        Ok(())
    }
}

/// JSON-file backed storage, written through on every mutation
#[derive(Debug)]
pub struct FileStringStorage {
    path: PathBuf,
    items: RwLock<BTreeMap<String, String>>,
}

impl FileStringStorage {
    pub fn open(path: impl Into<PathBuf>) -> GlucoseCheckResult<Self> {
        let path = path.into();
        let items = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| GlucoseCheckError::Storage(format!("read {}: {}", path.display(), e)))?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };
        debug!("Opened string storage {} ({} entries)", path.display(), items.len());
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &BTreeMap<String, String>) -> GlucoseCheckResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GlucoseCheckError::Storage(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let json = serde_json::to_string_pretty(items)?;
        std::fs::write(&self.path, json)
            .map_err(|e| GlucoseCheckError::Storage(format!("write {}: {}", self.path.display(), e)))
    }
}

impl GenericStringStorage for FileStringStorage {
    fn get_item(&self, key: &str) -> GlucoseCheckResult<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> GlucoseCheckResult<()> {
        let mut items = self.items.write();
        items.insert(key.to_string(), value.to_string());
        self.flush(&items)
    }

    fn remove_item(&self, key: &str) -> GlucoseCheckResult<()> {
        let mut items = self.items.write();
        if items.remove(key).is_some() {
            self.flush(&items)?;
        }
        Ok(())
    }
}
