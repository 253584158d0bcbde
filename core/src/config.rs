//! Embedder-supplied configuration. FamilyVault has no config *file* of its
//! own — paths and ports are passed in by the host application at
//! construction time, one `Config` shared across the several managers a
//! session owns.

use std::path::PathBuf;

/// Default service port.
pub const DEFAULT_SERVICE_PORT: u16 = 45678;
/// Default pairing port.
pub const DEFAULT_PAIRING_PORT: u16 = 45680;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory backing the file-transfer cache.
    pub cache_dir: PathBuf,
    /// Directory backing `SecureStorage`'s encrypted-file fallback.
    pub secure_storage_path: PathBuf,
    /// TLS-PSK service port; 0 lets the OS pick an ephemeral port.
    pub service_port: u16,
    /// Pairing TCP port.
    pub pairing_port: u16,
    /// Human-readable name announced to peers and shown in the UI.
    pub device_name: String,
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join("familyvault.db"),
            cache_dir: data_dir.join("cache"),
            secure_storage_path: data_dir.join("secure_storage.json"),
            service_port: DEFAULT_SERVICE_PORT,
            pairing_port: DEFAULT_PAIRING_PORT,
            device_name: device_name.into(),
        }
    }

    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    pub fn with_pairing_port(mut self, port: u16) -> Self {
        self.pairing_port = port;
        self
    }
}
