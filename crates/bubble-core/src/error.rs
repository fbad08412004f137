//! Unified error types for the bubble core library.
//!
//! [`BubbleError`] covers every failure mode surfaced by the engine and its
//! collaborators. Modules keep their own narrower error types
//! ([`ConfigError`](crate::config::ConfigError),
//! [`ProtocolError`](crate::protocol::ProtocolError),
//! [`RangingError`](crate::ranging::RangingError)) and convert into this one at
//! their boundary.
//!
//! # Example
//!
//! ```rust
//! use bubble_core::error::{BubbleError, Result};
//!
//! fn find(id: u32, known: &[u32]) -> Result<u32> {
//!     known
//!         .iter()
//!         .copied()
//!         .find(|k| *k == id)
//!         .ok_or(BubbleError::UnknownAccessory(id))
//! }
//!
//! assert!(find(3, &[1, 2]).is_err());
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::ranging::{RangingError, RangingErrorKind};

/// The unified error type for all bubble operations.
#[derive(Debug, Error)]
pub enum BubbleError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    BluetoothAdapterPoweredOff,

    /// A radio operation (scan, connect, GATT access) failed.
    #[error("Bluetooth operation failed: {0}")]
    BluetoothFailed(String),

    /// The peripheral is not known to the radio.
    #[error("Device not found: '{0}'. Ensure the accessory is powered on and within range.")]
    DeviceNotFound(String),

    // =========================================================================
    // ACCESSORY ERRORS
    // =========================================================================
    /// A frame could not be decoded or encoded.
    #[error("Accessory protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A ranging session failed or was refused.
    #[error("Ranging error: {0}")]
    Ranging(#[from] RangingError),

    /// No accessory with this unique id is known.
    #[error("Unknown accessory: acc-{0}")]
    UnknownAccessory(u32),

    // =========================================================================
    // POLICY COLLABORATOR ERRORS
    // =========================================================================
    /// The task store could not be read.
    #[error("Task source unavailable: {0}")]
    TaskSourceUnavailable(String),

    /// The shield service rejected a change.
    #[error("Enforcement failed: {0}")]
    EnforcementFailed(String),

    /// The engine task has exited and no longer accepts events.
    #[error("Engine is not running")]
    EngineStopped,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A JSON document could not be serialized or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized [`Result`] type for bubble operations.
pub type Result<T> = std::result::Result<T, BubbleError>;

/// Short alias for [`BubbleError`].
pub type Error = BubbleError;

impl BubbleError {
    /// Returns `true` if this error is a Bluetooth transport failure.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound
                | Self::BluetoothAdapterPoweredOff
                | Self::BluetoothFailed(_)
                | Self::DeviceNotFound(_)
        )
    }

    /// Returns `true` if an accessory sent or would be sent a bad frame.
    #[inline]
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns `true` if a ranging session failed.
    #[inline]
    #[must_use]
    pub const fn is_ranging_error(&self) -> bool {
        matches!(self, Self::Ranging(_))
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceError(_) | Self::IoError(_) | Self::Json(_)
        )
    }

    /// Returns `true` if the user must act (grant permission, power the
    /// adapter) before the operation can succeed.
    #[inline]
    #[must_use]
    pub fn is_user_actionable(&self) -> bool {
        match self {
            Self::BluetoothAdapterPoweredOff => true,
            Self::Ranging(e) => e.kind.is_user_actionable(),
            _ => false,
        }
    }

    /// Returns `true` if this error is likely recoverable without user intervention.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DeviceNotFound(_)
            | Self::BluetoothFailed(_)
            | Self::TaskSourceUnavailable(_)
            | Self::EnforcementFailed(_) => true,
            Self::Ranging(e) => e.kind.is_retryable(),
            _ => false,
        }
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::Protocol(_) => 400,

            // 403 Forbidden - the platform refused
            Self::Ranging(RangingError {
                kind: RangingErrorKind::PermissionDenied,
                ..
            }) => 403,

            // 404 Not Found
            Self::ConfigNotFound(_) | Self::DeviceNotFound(_) | Self::UnknownAccessory(_) => 404,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 424 Failed Dependency - an external collaborator failed
            Self::TaskSourceUnavailable(_) | Self::EnforcementFailed(_) | Self::Ranging(_) => 424,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) | Self::Json(_) => 500,

            // 503 Service Unavailable - hardware or engine not available
            Self::BluetoothAdapterNotFound
            | Self::BluetoothAdapterPoweredOff
            | Self::BluetoothFailed(_)
            | Self::EngineStopped => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothAdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::BluetoothFailed(_) => "BLUETOOTH_FAILED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Ranging(e) => match e.kind {
                RangingErrorKind::PermissionDenied => "RANGING_PERMISSION_DENIED",
                RangingErrorKind::ResourceTimeout => "RANGING_TIMEOUT",
                RangingErrorKind::SessionLimitExceeded => "RANGING_SESSION_LIMIT",
                RangingErrorKind::Unknown => "RANGING_FAILED",
            },
            Self::UnknownAccessory(_) => "UNKNOWN_ACCESSORY",
            Self::TaskSourceUnavailable(_) => "TASK_SOURCE_UNAVAILABLE",
            Self::EnforcementFailed(_) => "ENFORCEMENT_FAILED",
            Self::EngineStopped => "ENGINE_STOPPED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BubbleError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::NoConfigDir => {
                Self::PersistenceError("Cannot determine configuration directory".into())
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            err @ (ConfigError::ValidationError { .. }
            | ConfigError::MultipleValidationErrors(_)) => {
                Self::ConfigValidationError(err.to_string())
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
