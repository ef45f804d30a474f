use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::{Uuid, uuid};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "beam";
const APP_NAME: &str = "beam_transfer";
const DEVICE_ID_FILE: &str = "device_id.txt";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (tests, portable installs).
pub const CONFIG_DIR_ENV: &str = "BEAM_CONFIG_DIR";

/// Service identifier every peer advertises and scans for.
pub const DEFAULT_SERVICE_ID: Uuid = uuid!("12345678-1234-1234-1234-1234567890ab");

/// UDP port used by the broadcast radio
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device_name: String,
    pub download_path: PathBuf,
    /// 0 lets the OS pick a port
    pub listen_port: u16,
    pub discovery_port: u16,
    pub service_id: Uuid,
    pub connect_timeout_secs: u64,
    pub peer_stale_secs: u64,
    pub prune_interval_secs: u64,
    pub history_limit: usize,
    pub max_pending_requests: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let download_path = directories::UserDirs::new()
            .map(|dirs| {
                dirs.download_dir()
                    .map(|d| d.to_path_buf())
                    .unwrap_or_else(|| dirs.home_dir().join("Downloads"))
            })
            .unwrap_or_else(|| PathBuf::from("downloads"));

        Self {
            device_name: default_device_name(),
            download_path,
            listen_port: 0,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            service_id: DEFAULT_SERVICE_ID,
            connect_timeout_secs: 5,
            peer_stale_secs: 10,
            prune_interval_secs: 5,
            history_limit: 100,
            max_pending_requests: 16,
        }
    }
}

impl AppConfig {
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Missing or corrupt files give the defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> crate::Result<()> {
        match Self::get_config_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::info!("Config saved to {:?}", path);
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn peer_stale_after(&self) -> Duration {
        Duration::from_secs(self.peer_stale_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Load existing device ID from disk, or generate and save a new one
pub fn get_or_create_device_id() -> String {
    let Some(config_dir) = get_config_dir() else {
        // Not persistent: new id every run
        return Uuid::new_v4().to_string();
    };

    let id_path = config_dir.join(DEVICE_ID_FILE);

    if let Ok(id) = fs::read_to_string(&id_path) {
        let id = id.trim().to_string();
        if !id.is_empty() {
            return id;
        }
    }

    let new_id = Uuid::new_v4().to_string();

    if let Err(e) = fs::create_dir_all(&config_dir) {
        tracing::warn!("Could not create config dir {:?}: {}", config_dir, e);
        return new_id;
    }

    if let Err(e) = fs::write(&id_path, &new_id) {
        tracing::warn!("Could not save device ID: {}", e);
    }

    new_id
}

/// Who this device is on the wire.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub device_id: String,
    pub device_name: String,
}

impl LocalIdentity {
    pub fn load(config: &AppConfig) -> Self {
        Self {
            device_id: get_or_create_device_id(),
            device_name: config.device_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"listen_port": 9100, "history_limit": 5}"#;
        let config: AppConfig = serde_json::from_str(json).expect("Should deserialize");

        assert_eq!(config.listen_port, 9100);
        assert_eq!(config.history_limit, 5);
        assert_eq!(config.service_id, DEFAULT_SERVICE_ID);
        assert_eq!(config.peer_stale_after(), Duration::from_secs(10));
        assert_eq!(config.prune_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = AppConfig {
            device_name: "desk".to_string(),
            listen_port: 7300,
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.device_name, "desk");
        assert_eq!(loaded.listen_port, 7300);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_from(&path).listen_port, 0);
    }

    #[test]
    fn test_prune_interval_never_zero() {
        let config = AppConfig {
            prune_interval_secs: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.prune_interval(), Duration::from_secs(1));
    }
}
