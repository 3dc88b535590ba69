use std::path::PathBuf;
use std::sync::Arc;

use petrel_platform::JsonStore;
use petrel_update::KeyValueStore;
use serde_json::Value;

/// Adapts the JSON-file store to the string-keyed persistence boundary the
/// update engine expects.
pub struct StateStore {
    inner: Arc<JsonStore>,
}

impl StateStore {
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(JsonStore::open(path)),
        }
    }
}

impl KeyValueStore for StateStore {
    fn has(&self, key: &str) -> bool {
        self.inner.has(key)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner.get_str(key)
    }

    fn set(&self, key: &str, value: &str) {
        self.inner.set(key, Value::String(value.to_owned()));
    }

    fn delete(&self, key: &str) {
        self.inner.delete(key);
    }
}
