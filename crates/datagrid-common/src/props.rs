//! Persisted resource properties
//!
//! Composite resources keep small pieces of state (the round-robin next
//! child) outside the process so every server sharing a catalog sees the
//! same value. Updates go through compare-and-set so two concurrent
//! writers cannot both commit against the same observed value.

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

pub trait ResourcePropertyStore: Send + Sync {
    fn get_property(&self, resource: &str, key: &str) -> Result<Option<String>>;

    /// Store `value` only if the current value equals `expected`
    fn compare_and_set_property(
        &self,
        resource: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool>;
}

/// Process-local property store
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemoryPropertyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourcePropertyStore for MemoryPropertyStore {
    fn get_property(&self, resource: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .get(&(resource.to_string(), key.to_string()))
            .cloned())
    }

    fn compare_and_set_property(
        &self,
        resource: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let mut values = self.values.write();
        let slot = (resource.to_string(), key.to_string());
        if values.get(&slot).map(String::as_str) != expected {
            return Ok(false);
        }
        values.insert(slot, value.to_string());
        Ok(true)
    }
}
