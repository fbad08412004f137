//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. An optional TOML file (`/etc/bubble/config.toml` on Linux)
//! 3. Environment overrides, e.g. `BUBBLE_BUBBLE__INNER_THRESHOLD_M=0.3`
//!
//! Sections cover the accessory GATT layout, the bubble thresholds, the
//! restriction policy cadence and targets, storage location and timezone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::enforcement::RestrictionTargets;

/// Default GATT service advertised by the accessory.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x2e93_8fd0_6a61_11ed_a1eb_0242_ac12_0002);
/// Default synchronization characteristic (read once to trigger pairing).
pub const DEFAULT_SYNC_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x2e93_941c_6a61_11ed_a1eb_0242_ac12_0002);
/// Default characteristic the app writes frames to.
pub const DEFAULT_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x2e93_998a_6a61_11ed_a1eb_0242_ac12_0002);
/// Default characteristic the accessory notifies frames on.
pub const DEFAULT_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x2e93_9af2_6a61_11ed_a1eb_0242_ac12_0002);

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BUBBLE";

static ADAPTER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hci[0-9]{1,3}$").expect("valid adapter regex"));

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested configuration file does not exist.
    #[error("configuration file not found: {0}")]
    NotFound(String),

    /// The layered sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Writing the configuration file failed.
    #[error("failed to write {path}: {source}")]
    WriteError {
        /// Target path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The platform configuration directory cannot be determined.
    #[error("cannot determine the configuration directory")]
    NoConfigDir,

    /// A single field failed validation.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} configuration problems: {}", .0.len(), join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Accessory discovery and GATT layout.
    pub bluetooth: BluetoothConfig,
    /// Presence thresholds.
    pub bubble: BubbleConfig,
    /// Restriction policy cadence and targets.
    pub policy: PolicyConfig,
    /// Where logs and known accessories are stored.
    pub storage: StorageConfig,
    /// Host settings.
    pub system: SystemConfig,
}

/// Accessory discovery and GATT layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Service UUID the accessory advertises.
    pub service_uuid: Uuid,
    /// Characteristic read once to trigger pairing.
    pub sync_characteristic_uuid: Uuid,
    /// Characteristic the app writes frames to.
    pub rx_characteristic_uuid: Uuid,
    /// Characteristic the accessory notifies frames on.
    pub tx_characteristic_uuid: Uuid,
    /// How long a never-connected accessory may stay unseen before its link is destroyed.
    pub discovery_timeout_secs: u64,
    /// Write size assumed until the radio reports the negotiated MTU.
    pub default_max_write_len: usize,
    /// BlueZ adapter to use (`hci0`, ...). Defaults to the system default adapter.
    pub adapter_name: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            sync_characteristic_uuid: DEFAULT_SYNC_CHARACTERISTIC_UUID,
            rx_characteristic_uuid: DEFAULT_RX_CHARACTERISTIC_UUID,
            tx_characteristic_uuid: DEFAULT_TX_CHARACTERISTIC_UUID,
            discovery_timeout_secs: 5,
            default_max_write_len: 20,
            adapter_name: None,
        }
    }
}

impl BluetoothConfig {
    /// Discovery timeout as a chrono duration.
    #[must_use]
    pub fn discovery_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.discovery_timeout_secs).unwrap_or(i64::MAX))
    }
}

/// Presence thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BubbleConfig {
    /// At or below this distance the occupant is inside.
    pub inner_threshold_m: f32,
    /// At or above this distance the occupant is outside.
    pub outer_threshold_m: f32,
    /// How long a transition must hold before the policy acts on it.
    pub debounce_ms: u64,
}

impl Default for BubbleConfig {
    fn default() -> Self {
        Self {
            inner_threshold_m: 0.2,
            outer_threshold_m: 1.2,
            debounce_ms: 2_000,
        }
    }
}

impl BubbleConfig {
    /// Debounce window.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Restriction policy cadence and targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Re-evaluation period while in the foreground.
    pub foreground_tick_secs: u64,
    /// Re-evaluation period while in the background.
    pub background_tick_secs: u64,
    /// How long work may continue after moving to the background.
    pub background_window_secs: u64,
    /// Apps, categories and domains restricted when the decision is on.
    pub targets: RestrictionTargets,
    /// JSON export of scheduled tasks written by the reminder service.
    pub tasks_path: Option<PathBuf>,
    /// File the enforcement (shield) service watches.
    pub enforcement_path: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            foreground_tick_secs: 60,
            background_tick_secs: 300,
            background_window_secs: 30,
            targets: RestrictionTargets::default(),
            tasks_path: None,
            enforcement_path: None,
        }
    }
}

/// Where logs and known accessories are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to `/var/lib/bubble` on Linux.
    pub data_dir: Option<PathBuf>,
}

/// Host settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// IANA timezone that defines "today" for tasks and snapshots.
    pub timezone: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }
}

impl SystemConfig {
    /// Parsed timezone, falling back to UTC for unparseable names.
    #[must_use]
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

impl Config {
    /// Load configuration from the default location, environment included.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> ConfigResult<Self> {
        Self::load_or_default(default_config_path()?)
    }

    /// Load from `path` if it exists, otherwise from defaults, then apply
    /// environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load strictly from `path`, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_or_default(path)
    }

    /// Save configuration as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_error = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_error)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single problem found, or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        let bubble = &self.bubble;
        if !(bubble.inner_threshold_m > 0.0) {
            invalid(
                "bubble.inner_threshold_m",
                format!("must be positive, got {}", bubble.inner_threshold_m),
            );
        }
        if !(bubble.inner_threshold_m < bubble.outer_threshold_m) {
            invalid(
                "bubble.outer_threshold_m",
                format!(
                    "must be greater than the inner threshold ({} <= {})",
                    bubble.outer_threshold_m, bubble.inner_threshold_m
                ),
            );
        }

        let policy = &self.policy;
        for (field, value) in [
            ("policy.foreground_tick_secs", policy.foreground_tick_secs),
            ("policy.background_tick_secs", policy.background_tick_secs),
        ] {
            if value == 0 {
                invalid(field, "must be at least 1 second".to_string());
            }
        }

        let bt = &self.bluetooth;
        let characteristics = [
            bt.sync_characteristic_uuid,
            bt.rx_characteristic_uuid,
            bt.tx_characteristic_uuid,
        ];
        if characteristics[0] == characteristics[1]
            || characteristics[1] == characteristics[2]
            || characteristics[0] == characteristics[2]
        {
            invalid(
                "bluetooth.*_characteristic_uuid",
                "sync, rx and tx characteristics must be distinct".to_string(),
            );
        }
        if bt.default_max_write_len < 2 {
            invalid(
                "bluetooth.default_max_write_len",
                "must allow at least a message id and one payload byte".to_string(),
            );
        }
        if let Some(adapter) = &bt.adapter_name {
            if !is_valid_adapter_name(adapter) {
                invalid(
                    "bluetooth.adapter_name",
                    format!("'{adapter}' is not a BlueZ adapter name like 'hci0'"),
                );
            }
        }

        if self.system.timezone.parse::<Tz>().is_err() {
            invalid(
                "system.timezone",
                format!("'{}' is not an IANA timezone", self.system.timezone),
            );
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Whether `name` looks like a BlueZ adapter name.
#[must_use]
pub fn is_valid_adapter_name(name: &str) -> bool {
    ADAPTER_NAME_RE.is_match(name)
}

/// Default configuration file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoConfigDir`] when no platform directory exists.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/bubble/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "bubble").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!((config.bubble.inner_threshold_m - 0.2).abs() < f32::EPSILON);
        assert!((config.bubble.outer_threshold_m - 1.2).abs() < f32::EPSILON);
        assert_eq!(config.bubble.debounce(), Duration::from_secs(2));
        assert_eq!(config.policy.foreground_tick_secs, 60);
        assert_eq!(config.policy.background_tick_secs, 300);
        assert_eq!(config.bluetooth.discovery_timeout_secs, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.system.timezone, "UTC");
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = Config::load_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_save_and_reload_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bubble]\ninner_threshold_m = 0.3\n\n[system]\ntimezone = \"Europe/Berlin\"\n",
        )
        .unwrap();

        let config = Config::load_or_default(&path).unwrap();
        assert!((config.bubble.inner_threshold_m - 0.3).abs() < f32::EPSILON);
        assert!((config.bubble.outer_threshold_m - 1.2).abs() < f32::EPSILON);
        assert_eq!(config.system.tz(), chrono_tz::Europe::Berlin);

        let saved = dir.path().join("saved.toml");
        config.save(&saved).unwrap();
        assert_eq!(Config::load_from(&saved).unwrap(), config);
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut config = Config::default();
        config.bubble.inner_threshold_m = 2.0;
        config.policy.foreground_tick_secs = 0;
        config.system.timezone = "Mars/Olympus".to_string();

        match config.validate().unwrap_err() {
            ConfigError::MultipleValidationErrors(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_duplicate_characteristics_rejected() {
        let mut config = Config::default();
        config.bluetooth.tx_characteristic_uuid = config.bluetooth.rx_characteristic_uuid;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_adapter_name_validation() {
        assert!(is_valid_adapter_name("hci0"));
        assert!(is_valid_adapter_name("hci12"));
        assert!(!is_valid_adapter_name("wlan0"));
        assert!(!is_valid_adapter_name("hci"));
    }
}
