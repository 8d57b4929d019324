use thiserror::Error;
use uuid::Uuid;

use crate::protocol::AuthStep;

/// Errors that can occur while talking to the wrist band
#[derive(Error, Debug)]
pub enum BuzzerError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter available")]
    AdapterNotFound,

    /// The device handed to the backend was never discovered
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The hardware scanner reported a failure
    #[error("Scan failed with error code {0}")]
    ScanFailure(i32),

    /// The driver refused to accept a write request
    #[error("Characteristic write was not accepted by the driver")]
    WriteSubmissionFailure,

    /// The device answered a handshake step with unexpected bytes
    #[error("{0}: unexpected response")]
    UnexpectedResponse(AuthStep),

    /// Preparing the authentication characteristic failed
    #[error("{0}: setup failed")]
    SetupFailed(AuthStep),

    /// No connected session or ready characteristic is held
    #[error("Not ready")]
    NotReady,

    /// The operation was cancelled by an abort or a disconnection
    #[error("Connection aborted")]
    ConnectionAborted,

    /// An event arrived that the current operation cannot handle
    #[error("Unexpected event: {0}")]
    ProtocolViolation(String),

    /// The hardware reported a GATT level failure
    #[error("GATT error: {0}")]
    Gatt(String),

    /// A required characteristic was missing after service discovery
    #[error("Characteristic {characteristic} not found in service {service}")]
    MissingCharacteristic {
        /// Service that was searched
        service: Uuid,
        /// Characteristic that was expected
        characteristic: Uuid,
    },

    /// A background operation was requested outside a tokio runtime
    #[error("No async runtime available")]
    RuntimeUnavailable,

    /// A response did not arrive in time
    #[error("Response timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
}

/// Result type for band operations
pub type Result<T> = std::result::Result<T, BuzzerError>;

impl BuzzerError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::AdapterNotFound
                | Self::DeviceNotFound(_)
                | Self::ScanFailure(_)
                | Self::Gatt(_)
                | Self::MissingCharacteristic { .. }
        )
    }

    /// Check if this error only reports that the chain was cancelled
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::ConnectionAborted)
    }

    /// The handshake step this error belongs to, if any
    #[must_use]
    pub const fn auth_step(&self) -> Option<AuthStep> {
        match self {
            Self::UnexpectedResponse(step) | Self::SetupFailed(step) => Some(*step),
            _ => None,
        }
    }
}
