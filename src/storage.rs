//! Per-vnode in-memory key/value store.

use dashmap::DashMap;

use crate::err::Error;
use crate::err::Result;

/// String-to-string mapping owned by one vnode. No size bound, no iteration
/// contract, no cross-vnode visibility.
#[derive(Debug, Default)]
pub struct DataStore {
    data: DashMap<String, String>,
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Result<String> {
        self.data
            .get(key)
            .map(|v| v.value().clone())
            .ok_or(Error::KeyNotFound)
    }

    /// Idempotent; overwrites an existing value.
    pub fn set(&self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    /// Idempotent; deleting a missing key is not an error.
    pub fn delete(&self, key: &str) {
        self.data.remove(key);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
