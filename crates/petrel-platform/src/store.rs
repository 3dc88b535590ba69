use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use serde_json::Value;

/// JSON-file-backed key/value store.
///
/// Keys map to arbitrary JSON values. The whole map is read once on open and
/// rewritten on every mutation. There is no cross-process locking; the
/// application's single-instance guard is the only protection against
/// concurrent writers.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<HashMap<String, Value>>,
}

impl JsonStore {
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let data = read_map(&path);
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.lock()
            .get(key)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }

    pub fn set(&self, key: &str, value: Value) {
        {
            let mut data = self.lock();
            data.insert(key.to_owned(), value);
        }
        self.flush();
    }

    pub fn delete(&self, key: &str) {
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.flush();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Write the current map to disk. On a tokio runtime the write moves
    /// to the blocking pool; the rename keeps whichever write lands last
    /// internally consistent.
    fn flush(&self) {
        let snapshot = self.lock().clone();
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("Error serializing store {}: {error}", self.path.display());
                return;
            }
        };

        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_snapshot(&path, &bytes));
            }
            Err(_) => write_snapshot(&path, &bytes),
        }
    }
}

fn write_snapshot(path: &Path, bytes: &[u8]) {
    if let Err(error) = write_atomic(path, bytes) {
        warn!("Error writing store {}: {error}", path.display());
    }
}

fn read_map(path: &Path) -> HashMap<String, Value> {
    let Ok(json) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&json) {
        Ok(map) => map,
        Err(error) => {
            warn!("Error reading store {}: {error}", path.display());
            HashMap::new()
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "store path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;

    static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);
    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("store");
    let tmp_path = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::JsonStore;

    #[test]
    fn set_writes_through_and_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");

        let store = JsonStore::open(path.clone());
        store.set("updates.pending-version", json!("1.2.3"));
        drop(store);

        let reopened = JsonStore::open(path);
        assert!(reopened.has("updates.pending-version"));
        assert_eq!(
            reopened.get_str("updates.pending-version").as_deref(),
            Some("1.2.3")
        );
    }

    #[test]
    fn delete_removes_key_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");

        let store = JsonStore::open(path.clone());
        store.set("marker", Value::Bool(true));
        store.delete("marker");
        drop(store);

        let reopened = JsonStore::open(path);
        assert!(!reopened.has("marker"));
    }

    #[tokio::test]
    async fn set_on_a_runtime_reaches_disk() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");

        let store = JsonStore::open(path.clone());
        store.set("marker", Value::Bool(true));

        // The write runs on the blocking pool; wait for the file to land.
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let reopened = JsonStore::open(path);
        assert!(reopened.has("marker"));
    }

    #[test]
    fn open_tolerates_corrupt_file() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");
        std::fs::write(&path, b"not json").expect("corrupt file should be written");

        let store = JsonStore::open(path);
        assert!(!store.has("anything"));
    }
}
