use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub supervisor: SupervisorConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from environment variables, with defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            // Override with environment variables using `SYNCBOX` prefix and `__` separator
            // e.g., SYNCBOX__SERVER__PORT=8001 or SYNCBOX__CLIENT__SYNC_FOLDER=/data/sync
            .add_source(
                config::Environment::with_prefix("SYNCBOX")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;

        // The supervisor pins each worker's listen address and storage
        // directories through plain environment variables; they take
        // precedence over everything else.
        config.apply_worker_env();

        Ok(config)
    }

    /// Applies the plain worker environment variables (`PORT`, `HOST`,
    /// `SHARED_STORAGE_ROOT`, `FILES_DIR`, `VERSIONS_DIR`, `METADATA_DIR`,
    /// `CHUNKS_DIR`, `CONFLICTS_DIR`) as final overrides.
    fn apply_worker_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(root) = std::env::var("SHARED_STORAGE_ROOT") {
            self.storage.shared_root = root;
        }
        if let Ok(dir) = std::env::var("FILES_DIR") {
            self.storage.files_dir = Some(dir);
        }
        if let Ok(dir) = std::env::var("VERSIONS_DIR") {
            self.storage.versions_dir = Some(dir);
        }
        if let Ok(dir) = std::env::var("METADATA_DIR") {
            self.storage.metadata_dir = Some(dir);
        }
        if let Ok(dir) = std::env::var("CHUNKS_DIR") {
            self.storage.chunks_dir = Some(dir);
        }
        if let Ok(dir) = std::env::var("CONFLICTS_DIR") {
            self.storage.conflicts_dir = Some(dir);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host address to bind to (default: "0.0.0.0")
    pub host: String,
    /// Port to listen on (default: 8001)
    pub port: u16,
    /// Maximum accepted request body size in bytes. Uploads above this
    /// limit are rejected with 413; clients switch to chunked upload well
    /// below it.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory shared by every supervised worker. All stores resolve
    /// under it unless an explicit per-directory override is set.
    pub shared_root: String,
    pub files_dir: Option<String>,
    pub versions_dir: Option<String>,
    pub metadata_dir: Option<String>,
    pub chunks_dir: Option<String>,
    pub conflicts_dir: Option<String>,
    /// When true, DELETE also removes the version history and metadata.
    /// Default keeps history: the name is un-listed but versions stay
    /// downloadable.
    pub delete_cascade: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shared_root: "./shared_storage".to_string(),
            files_dir: None,
            versions_dir: None,
            metadata_dir: None,
            chunks_dir: None,
            conflicts_dir: None,
            delete_cascade: false,
        }
    }
}

impl StorageConfig {
    pub fn files_dir(&self) -> PathBuf {
        self.resolve(&self.files_dir, "files")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.resolve(&self.versions_dir, "versions")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.resolve(&self.metadata_dir, "metadata")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.resolve(&self.chunks_dir, "chunks")
    }

    pub fn conflicts_dir(&self) -> PathBuf {
        self.resolve(&self.conflicts_dir, "metadata/conflicts")
    }

    fn resolve(&self, override_dir: &Option<String>, default_leaf: &str) -> PathBuf {
        match override_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.shared_root).join(default_leaf),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Address the public proxy listener binds to (default: "0.0.0.0")
    pub host: String,
    /// Public proxy port (default: 8000)
    pub port: u16,
    /// Number of workers kept alive at all times (default: 2)
    pub min_instances: usize,
    /// Hard cap on spawned workers (default: 4)
    pub max_instances: usize,
    /// First internal worker port; workers get consecutive ports from here.
    pub worker_base_port: u16,
    /// Path to the worker binary. Empty means "resolve a sibling of the
    /// supervisor executable, falling back to PATH lookup".
    pub worker_binary: String,
    /// Seconds between health probe rounds (default: 5)
    pub health_check_interval_secs: u64,
    /// Seconds a worker may stay unhealthy before it is killed and
    /// respawned (default: 30)
    pub unhealthy_kill_secs: u64,
    /// Milliseconds between worker spawns at startup, to reduce disk
    /// contention at the metadata migration step (default: 2000)
    pub spawn_stagger_ms: u64,
    /// Grace window in seconds between the gentle shutdown signal and the
    /// hard kill (default: 5)
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            min_instances: 2,
            max_instances: 4,
            worker_base_port: 8001,
            worker_binary: String::new(),
            health_check_interval_secs: 5,
            unhealthy_kill_secs: 30,
            spawn_stagger_ms: 2000,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Base URL of the server (usually the supervisor's public port).
    pub server_url: String,
    /// Local folder kept in agreement with the server store.
    pub sync_folder: String,
    /// Stable client identifier; derived from the operator-supplied name.
    pub client_name: String,
    /// Seconds between reconciler ticks. Must be at least the server's
    /// conflict window to avoid spurious re-uploads (default: 2).
    pub poll_interval_secs: u64,
    /// Files above this size upload in numbered chunks (default: 10 MiB).
    pub chunk_size_bytes: u64,
    /// Seconds a local file not present on the server is still considered
    /// "new" and uploaded rather than removed (default: 60).
    pub new_file_grace_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            sync_folder: "./sync_folder".to_string(),
            client_name: "client".to_string(),
            poll_interval_secs: 2,
            chunk_size_bytes: 10 * 1024 * 1024,
            new_file_grace_secs: 60,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Use serde to serialize to pretty JSON
        match serde_json::to_string_pretty(&self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "Error serializing config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_dirs_resolve_under_shared_root() {
        let storage = StorageConfig {
            shared_root: "/srv/syncbox".to_string(),
            ..StorageConfig::default()
        };
        assert_eq!(storage.files_dir(), PathBuf::from("/srv/syncbox/files"));
        assert_eq!(
            storage.conflicts_dir(),
            PathBuf::from("/srv/syncbox/metadata/conflicts")
        );
    }

    #[test]
    fn test_explicit_dir_override_wins() {
        let storage = StorageConfig {
            shared_root: "/srv/syncbox".to_string(),
            chunks_dir: Some("/fast-scratch/chunks".to_string()),
            ..StorageConfig::default()
        };
        assert_eq!(storage.chunks_dir(), PathBuf::from("/fast-scratch/chunks"));
    }
}
