//! Session configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! command_buffer = 64
//! unknown_device_name = "Unknown"
//!
//! [central]
//! auto_subscribe = "notify_or_indicate"
//! discovery_failure = "keep_connected"
//! max_mtu = 517
//!
//! [logging]
//! enabled = false
//! default_directive = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use gattbridge_types::{MAX_ATT_MTU, MIN_ATT_MTU};

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the command queue into the session task.
    pub command_buffer: usize,
    /// Name reported for remote devices that advertise none.
    pub unknown_device_name: String,
    /// GATT client behavior.
    pub central: CentralConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_buffer: 64,
            unknown_device_name: "Unknown".to_string(),
            central: CentralConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use gattbridge_core::SessionConfig;
    ///
    /// SessionConfig::default().validate().expect("defaults are valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.command_buffer == 0 {
            errors.push(ValidationError {
                field: "command_buffer".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.unknown_device_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "unknown_device_name".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        errors.extend(self.central.validate());
        errors.extend(self.logging.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Which discovered characteristics are subscribed to automatically after
/// service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSubscribe {
    /// Every characteristic that can notify or indicate.
    #[default]
    NotifyOrIndicate,
    /// Only characteristics that can notify.
    NotifyOnly,
    /// Never; the application gets no notifications.
    Disabled,
}

/// What happens to a link whose service discovery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryFailurePolicy {
    /// Stay connected with no usable characteristics.
    #[default]
    KeepConnected,
    /// Tear the link down as if `disconnect` had been called.
    Disconnect,
}

/// GATT client behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    pub auto_subscribe: AutoSubscribe,
    pub discovery_failure: DiscoveryFailurePolicy,
    /// Upper bound applied to `request_mtu`.
    pub max_mtu: u16,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            auto_subscribe: AutoSubscribe::default(),
            discovery_failure: DiscoveryFailurePolicy::default(),
            max_mtu: MAX_ATT_MTU,
        }
    }
}

impl CentralConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(MIN_ATT_MTU..=MAX_ATT_MTU).contains(&self.max_mtu) {
            errors.push(ValidationError {
                field: "central.max_mtu".to_string(),
                message: format!(
                    "must be between {} and {}, got {}",
                    MIN_ATT_MTU, MAX_ATT_MTU, self.max_mtu
                ),
            });
        }
        errors
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Initial state of the runtime log switch.
    pub enabled: bool,
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_directive: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = EnvFilter::try_new(&self.default_directive) {
            errors.push(ValidationError {
                field: "logging.default_directive".to_string(),
                message: format!("invalid filter directive: {}", e),
            });
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `central.max_mtu`).
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
