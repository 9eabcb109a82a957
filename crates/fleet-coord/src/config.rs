//! # Coordinator Configuration
//!
//! Configuration management for the fleet coordinator.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FLEET_DEVICE_ID=pos-1                                              │
//! │     FLEET_SYNC_INTERVAL_SECS=30                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fleet-coord/coordinator.toml (Linux)                     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, 30s sync interval                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # coordinator.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! priority = 50  # For leader election (higher = preferred leader)
//!
//! [store]
//! database_path = "/var/lib/fleet/fleet.db"
//!
//! [sync]
//! interval_secs = 30
//! batch_size = 100
//! max_dispatch_attempts = 3
//!
//! [guard]
//! drift_threshold_secs = 300
//! rate_limit_window_secs = 60
//! rate_limit_max_ops = 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordError, CoordResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Priority for leader election (0-100).
    /// Higher values make this device the preferred leader.
    /// Default: 50
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    50
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            priority: default_priority(),
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for the coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "fleet", "coord")
        .map(|dirs| dirs.data_dir().join("fleet.db"))
        .unwrap_or_else(|| PathBuf::from("fleet.db"))
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_path: default_database_path(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between periodic sync runs (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Number of pending events drained per periodic run.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Dispatch attempts before an event is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_dispatch_attempts: i64,
}

fn default_interval() -> u64 {
    30
}
fn default_batch_size() -> i64 {
    100
}
fn default_max_attempts() -> i64 {
    3
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval_secs: default_interval(),
            batch_size: default_batch_size(),
            max_dispatch_attempts: default_max_attempts(),
        }
    }
}

// =============================================================================
// Guard Settings
// =============================================================================

/// Edge-case guard thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Clock drift beyond this is flagged (seconds).
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold_secs: u64,

    /// Sliding window for the per-device rate limiter (seconds).
    #[serde(default = "default_rate_window")]
    pub rate_limit_window_secs: u64,

    /// Maximum operations per device per window.
    #[serde(default = "default_rate_max_ops")]
    pub rate_limit_max_ops: i64,

    /// Payloads above this are sent in chunks (bytes).
    #[serde(default = "default_chunked_threshold")]
    pub chunked_threshold_bytes: usize,

    /// Chunk size for chunked transfers (bytes).
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Payloads above this are compressed before sending (bytes).
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
}

fn default_drift_threshold() -> u64 {
    300 // 5 minutes
}
fn default_rate_window() -> u64 {
    60
}
fn default_rate_max_ops() -> i64 {
    100
}
fn default_chunked_threshold() -> usize {
    1024 * 1024 // 1 MB
}
fn default_chunk_size() -> usize {
    256 * 1024
}
fn default_compression_threshold() -> usize {
    100 * 1024
}

impl Default for GuardSettings {
    fn default() -> Self {
        GuardSettings {
            drift_threshold_secs: default_drift_threshold(),
            rate_limit_window_secs: default_rate_window(),
            rate_limit_max_ops: default_rate_max_ops(),
            chunked_threshold_bytes: default_chunked_threshold(),
            chunk_size_bytes: default_chunk_size(),
            compression_threshold_bytes: default_compression_threshold(),
        }
    }
}

// =============================================================================
// Main Coordinator Configuration
// =============================================================================

/// Complete coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Sync pipeline settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Edge-case guard thresholds.
    #[serde(default)]
    pub guard: GuardSettings,
}

impl CoordinatorConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (coordinator.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> CoordResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading coordinator config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load coordinator config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> CoordResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| CoordError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Coordinator config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CoordResult<()> {
        if self.device.id.is_empty() {
            return Err(CoordError::InvalidConfig("device id must not be empty".into()));
        }

        if !(0..=100).contains(&self.device.priority) {
            return Err(CoordError::InvalidConfig(format!(
                "device priority must be 0-100, got {}",
                self.device.priority
            )));
        }

        if self.sync.interval_secs == 0 {
            return Err(CoordError::InvalidConfig(
                "sync interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.max_dispatch_attempts < 1 {
            return Err(CoordError::InvalidConfig(
                "max_dispatch_attempts must be at least 1".into(),
            ));
        }

        if self.guard.rate_limit_max_ops < 1 {
            return Err(CoordError::InvalidConfig(
                "rate_limit_max_ops must be at least 1".into(),
            ));
        }

        if self.guard.chunk_size_bytes == 0
            || self.guard.chunk_size_bytes > self.guard.chunked_threshold_bytes
        {
            return Err(CoordError::InvalidConfig(
                "chunk_size_bytes must be non-zero and at most chunked_threshold_bytes".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("FLEET_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(priority) = std::env::var("FLEET_DEVICE_PRIORITY") {
            if let Ok(p) = priority.parse::<i64>() {
                self.device.priority = p;
            }
        }

        if let Ok(path) = std::env::var("FLEET_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.database_path = PathBuf::from(path);
        }

        if let Ok(interval) = std::env::var("FLEET_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.sync.interval_secs = secs;
            }
        }

        if let Ok(max_ops) = std::env::var("FLEET_RATE_LIMIT_MAX_OPS") {
            if let Ok(n) = max_ops.parse::<i64>() {
                self.guard.rate_limit_max_ops = n;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fleet", "coord")
            .map(|dirs| dirs.config_dir().join("coordinator.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the periodic sync interval.
    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.device.priority, 50);
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.sync.max_dispatch_attempts, 3);
        assert_eq!(config.guard.drift_threshold_secs, 300);
        assert_eq!(config.guard.rate_limit_max_ops, 100);
    }

    #[test]
    fn test_config_validation() {
        let mut config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());

        config.device.id = String::new();
        assert!(config.validate().is_err());

        config.device.id = "pos-1".to_string();
        config.device.priority = 250;
        assert!(config.validate().is_err());

        config.device.priority = 50;
        config.sync.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = CoordinatorConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[guard]"));

        let parsed: CoordinatorConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.device.id, config.device.id);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: CoordinatorConfig = toml::from_str(
            r#"
            [device]
            id = "pos-9"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.device.id, "pos-9");
        assert_eq!(parsed.sync.interval_secs, 30);
        assert_eq!(parsed.guard.chunk_size_bytes, 256 * 1024);
    }
}
