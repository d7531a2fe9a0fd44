//! Configuration store: the xenstore-style keyspace each device reads its
//! configuration from and publishes capability keys into (§6). no persisted
//! state, every `init` re-reads from scratch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub trait XenStore: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: String);
}

/// In-memory keystore, keyed exactly like the real per-device xenstore
/// paths would be (flat strings, no hierarchy needed at this scope).
/// Sufficient to drive `init`/`connect` in tests and to stand in for the
/// real store in a first deployment.
#[derive(Clone, Default)]
pub struct MemXenStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemXenStore {
    pub fn new() -> Self {
        MemXenStore::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        self.inner.lock().unwrap().insert(key.into(), value.into());
        self
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().clone()
    }
}

impl XenStore for MemXenStore {
    fn read(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn write(&self, key: &str, value: String) {
        self.inner.lock().unwrap().insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let store = MemXenStore::new();
        store.write("sector-size", "512".to_string());
        assert_eq!(store.read("sector-size").as_deref(), Some("512"));
        assert_eq!(store.read("missing"), None);
    }
}
