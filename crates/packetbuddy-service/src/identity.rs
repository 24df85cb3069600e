//! Stable device identity.
//!
//! A device ID is generated once per install and kept in a small text file
//! next to the database. Host name and OS are read fresh on every start so
//! a renamed machine updates its device row.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the file holding the device ID.
pub const DEVICE_ID_FILE: &str = "device_id";

/// Who this agent reports as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable identifier.
    pub device_id: String,
    /// Operating system family.
    pub os_type: String,
    /// Current host name.
    pub hostname: String,
}

impl DeviceIdentity {
    /// Read the device ID from `path`, creating it if absent or unreadable.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();

        let device_id = match std::fs::read_to_string(path) {
            Ok(content) => match Uuid::parse_str(content.trim()) {
                Ok(id) => id.to_string(),
                Err(_) => {
                    warn!(
                        "Device ID file {} is malformed, generating a new ID",
                        path.display()
                    );
                    write_new_id(path)?
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => write_new_id(path)?,
            Err(e) => return Err(e),
        };

        Ok(Self {
            device_id,
            os_type: std::env::consts::OS.to_string(),
            hostname: current_hostname(),
        })
    }

    /// Identity file location inside the data directory.
    pub fn default_path() -> PathBuf {
        packetbuddy_store::default_data_dir().join(DEVICE_ID_FILE)
    }
}

fn write_new_id(path: &Path) -> std::io::Result<String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let id = Uuid::new_v4().to_string();
    std::fs::write(path, &id)?;
    info!("Generated device ID {}", id);
    Ok(id)
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_and_reuses_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(DEVICE_ID_FILE);

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(Uuid::parse_str(&first.device_id).is_ok());

        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(second.os_type, std::env::consts::OS);
        assert!(!second.hostname.is_empty());
    }

    #[test]
    fn test_malformed_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEVICE_ID_FILE);
        std::fs::write(&path, "not-a-uuid").unwrap();

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert!(Uuid::parse_str(&identity.device_id).is_ok());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            identity.device_id
        );
    }

    #[test]
    fn test_whitespace_around_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEVICE_ID_FILE);
        let id = Uuid::new_v4();
        std::fs::write(&path, format!("{}\n", id)).unwrap();

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(identity.device_id, id.to_string());
    }
}
