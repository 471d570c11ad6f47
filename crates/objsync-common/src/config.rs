//! Configuration types for the objsync storage core
//!
//! Only the knobs the storage core consumes live here; transport and API
//! configuration belong to the embedding service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for the storage core
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store connection
    pub mongo: MongoConfig,
    /// Payload placement and maintenance
    pub storage: StorageConfig,
    /// Seconds after which a silent leader is considered gone
    pub leadership_timeout_secs: i32,
    /// Base notification resend interval in seconds; the effective resend
    /// window is six times this value
    pub resend_interval_secs: i64,
}

/// MongoDB connection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    /// Comma-separated list of `host:port` addresses
    pub address_csv: String,
    /// Database to authenticate against
    pub auth_db_name: String,
    pub username: String,
    pub password: String,
    /// Database holding the sync collections
    pub db_name: String,
    pub use_ssl: bool,
    /// CA certificate for server verification: an absolute path, a path
    /// relative to the persistence root, or inline PEM
    pub ca_certificate: String,
    /// Skip server certificate verification. Avoid outside development.
    pub allow_invalid_certificates: bool,
    /// Total dial-retry budget in seconds
    pub connect_timeout_secs: u64,
    /// Connection pool size; 1 or less disables pooling
    pub session_cache_size: u32,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            address_csv: "localhost:27017".to_string(),
            auth_db_name: "admin".to_string(),
            username: String::new(),
            password: String::new(),
            db_name: "d_edge".to_string(),
            use_ssl: false,
            ca_certificate: String::new(),
            allow_invalid_certificates: false,
            connect_timeout_secs: 300,
            session_cache_size: 0,
        }
    }
}

/// Payload placement and maintenance configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for file-backed payloads and seed files
    pub persistence_root_path: PathBuf,
    /// Where object payloads are kept
    pub payload_backend: PayloadBackend,
    /// Period of the background maintenance scan in seconds
    pub maintenance_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistence_root_path: PathBuf::from("/var/objsync"),
            payload_backend: PayloadBackend::Database,
            maintenance_interval_secs: 30,
        }
    }
}

/// Selects the payload store backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadBackend {
    /// Files under the persistence root, staged with rename-on-finalize
    File,
    /// Chunked blobs inside the metadata database
    #[default]
    Database,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongo: MongoConfig::default(),
            storage: StorageConfig::default(),
            leadership_timeout_secs: 45,
            resend_interval_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mongo.address_csv, "localhost:27017");
        assert_eq!(config.mongo.connect_timeout_secs, 300);
        assert_eq!(config.storage.payload_backend, PayloadBackend::Database);
        assert_eq!(config.leadership_timeout_secs, 45);
        assert_eq!(config.resend_interval_secs, 5);
    }

    #[test]
    fn test_config_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "mongo": {"address_csv": "db1:27017,db2:27017", "use_ssl": true},
                "storage": {"payload_backend": "file"},
                "resend_interval_secs": 10
            }"#,
        )
        .unwrap();
        assert_eq!(config.mongo.address_csv, "db1:27017,db2:27017");
        assert!(config.mongo.use_ssl);
        assert_eq!(config.storage.payload_backend, PayloadBackend::File);
        assert_eq!(config.resend_interval_secs, 10);
        // untouched sections keep their defaults
        assert_eq!(config.storage.maintenance_interval_secs, 30);
    }
}
