use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const DEVICE_ID_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceInfoFile {
    #[serde(rename = "deviceId")]
    device_id: String,
}

/// Load the persisted device id, generating and persisting a fresh one when
/// the file is missing or its content is unusable. The id is stable across
/// runs and identifies this installation to the config endpoint.
#[must_use]
pub fn load_or_create_device_id(path: &Path) -> String {
    if let Some(existing) = read_device_id(path) {
        return existing;
    }

    let device_id = generate_device_id();
    let file = DeviceInfoFile {
        device_id: device_id.clone(),
    };
    match serde_json::to_vec_pretty(&file) {
        Ok(bytes) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(error) = std::fs::write(path, bytes) {
                warn!("Error persisting device info: {error}");
            }
        }
        Err(error) => warn!("Error serializing device info: {error}"),
    }
    device_id
}

fn read_device_id(path: &Path) -> Option<String> {
    let json = std::fs::read_to_string(path).ok()?;
    let file: DeviceInfoFile = match serde_json::from_str(&json) {
        Ok(file) => file,
        Err(error) => {
            warn!("Error parsing device info, regenerating: {error}");
            return None;
        }
    };
    if is_valid_device_id(&file.device_id) {
        Some(file.device_id)
    } else {
        warn!("Persisted device id is malformed, regenerating");
        None
    }
}

fn is_valid_device_id(id: &str) -> bool {
    id.len() == DEVICE_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn generate_device_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    // Stack address as a per-invocation entropy supplement.
    let marker = 0u8;
    hasher.update((std::ptr::from_ref(&marker) as usize).to_le_bytes());

    let digest = hasher.finalize();
    let mut id = String::with_capacity(DEVICE_ID_LEN);
    for byte in digest.iter().take(DEVICE_ID_LEN / 2) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::{is_valid_device_id, load_or_create_device_id};

    #[test]
    fn generated_id_is_32_hex_chars_and_stable_across_loads() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("device-info.json");

        let first = load_or_create_device_id(&path);
        assert!(is_valid_device_id(&first), "got {first:?}");

        let second = load_or_create_device_id(&path);
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_persisted_id_is_regenerated() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("device-info.json");
        std::fs::write(&path, r#"{"deviceId": "not-hex"}"#)
            .expect("device info should be written");

        let id = load_or_create_device_id(&path);
        assert!(is_valid_device_id(&id));
    }
}
