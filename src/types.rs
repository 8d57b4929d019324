use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::{error::BuzzerError, protocol::DEVICE_NAME};

/// A peripheral found by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    /// Backend specific identifier of the peripheral
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
}

impl DeviceRef {
    /// Create a new device reference
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }
}

/// Reference to the single live GATT session
///
/// Only the connection manager creates and releases sessions; everyone else
/// copies this reference out of the session slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef {
    /// Identifier assigned by the backend when the link came up
    pub id: u64,
    /// Device the session is connected to
    pub device: DeviceRef,
}

/// A characteristic inside a discovered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID, used for matching events
    pub uuid: Uuid,
}

impl CharacteristicRef {
    /// Create a new characteristic reference
    #[must_use]
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }

    /// Reference one of this characteristic's descriptors
    #[must_use]
    pub const fn descriptor(self, uuid: Uuid) -> DescriptorRef {
        DescriptorRef {
            characteristic: self,
            uuid,
        }
    }
}

/// A descriptor attached to a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    /// Owning characteristic
    pub characteristic: CharacteristicRef,
    /// Descriptor UUID
    pub uuid: Uuid,
}

/// Protocol events published on the relay by the hardware backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The scanner found a device matching the filter
    ScanFound(DeviceRef),
    /// The scanner failed with a hardware error code
    ScanFailed(i32),
    /// A GATT link came up; services are not discovered yet
    Connected(SessionRef),
    /// Service discovery completed on the session
    ServicesDiscovered(SessionRef),
    /// The link went down
    Disconnected,
    /// A characteristic read completed
    CharacteristicRead {
        /// Characteristic that was read
        characteristic: CharacteristicRef,
        /// Value read
        value: Bytes,
    },
    /// A characteristic write was confirmed
    CharacteristicWrite {
        /// Characteristic that was written
        characteristic: CharacteristicRef,
        /// Value written
        value: Bytes,
    },
    /// The device notified a new characteristic value
    CharacteristicChanged {
        /// Characteristic that changed
        characteristic: CharacteristicRef,
        /// Notified value
        value: Bytes,
    },
    /// A descriptor read completed
    DescriptorRead(DescriptorRef),
    /// A descriptor write was confirmed
    DescriptorWrite(DescriptorRef),
    /// The hardware reported a failure
    Error(String),
    /// Cancel every chain scoped to the current connection
    Abort,
}

impl Event {
    /// Short name of the event kind, used in logs and errors
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ScanFound(_) => "ScanFound",
            Self::ScanFailed(_) => "ScanFailed",
            Self::Connected(_) => "Connected",
            Self::ServicesDiscovered(_) => "ServicesDiscovered",
            Self::Disconnected => "Disconnected",
            Self::CharacteristicRead { .. } => "CharacteristicRead",
            Self::CharacteristicWrite { .. } => "CharacteristicWrite",
            Self::CharacteristicChanged { .. } => "CharacteristicChanged",
            Self::DescriptorRead(_) => "DescriptorRead",
            Self::DescriptorWrite(_) => "DescriptorWrite",
            Self::Error(_) => "Error",
            Self::Abort => "Abort",
        }
    }

    /// Whether this event ends every chain scoped to the connection
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Abort)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanFailed(code) => write!(f, "ScanFailed({code})"),
            Self::Error(cause) => write!(f, "Error({cause})"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Scanner duty cycle requested from the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Scan continuously for the lowest discovery latency
    #[default]
    LowLatency,
}

/// Name based scan filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    /// Exact advertised name to match
    pub device_name: String,
    /// Requested scan mode
    pub mode: ScanMode,
}

/// Options for establishing a GATT connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Let the stack reconnect on its own after a link loss
    pub auto_connect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_connect: false,
        }
    }
}

/// Write type requested from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Ask the device to confirm the write
    WithResponse,
    /// Fire and forget
    WithoutResponse,
}

/// Connection manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session and no scan
    #[default]
    Disconnected,
    /// Looking for the device
    Scanning,
    /// Connect submitted, waiting for the link
    Connecting,
    /// Link up, waiting for service discovery
    AwaitingServices,
    /// Services discovered, session usable
    Ready,
    /// Tear down in progress
    Aborting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::AwaitingServices => write!(f, "Awaiting Services"),
            Self::Ready => write!(f, "Ready"),
            Self::Aborting => write!(f, "Aborting"),
        }
    }
}

/// Lifecycle notifications sent to a buzzer listener
#[derive(Debug)]
pub enum BuzzerEvent {
    /// The buzzer can vibrate
    Ready,
    /// The buzzer connection is closed
    Closed,
    /// The authentication handshake succeeded
    Authenticated,
    /// An operation failed
    Error(BuzzerError),
}

/// Band buzzer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuzzerConfig {
    /// Advertised name of the band
    pub device_name: String,
    /// How long an alert vibrates, in milliseconds
    pub buzz_duration_ms: u64,
    /// Give up waiting for a write response after this long; `None` waits
    /// until the connection is aborted
    pub response_timeout_ms: Option<u64>,
}

impl BuzzerConfig {
    /// Response timeout as a [`Duration`]
    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for BuzzerConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            buzz_duration_ms: 1_000,
            response_timeout_ms: Some(10_000),
        }
    }
}

/// Thresholds deciding when a pitched sound is an alert
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionPolicy {
    /// Average pitch over the window must exceed this, in Hz
    pub min_pitch_average_hz: f32,
    /// Peak pitch over the window must exceed this, in Hz
    pub min_pitch_peak_hz: f32,
    /// Minimum time between two detections, in seconds
    pub min_interval_secs: f32,
    /// How far back pitched samples are considered, in seconds
    pub window_secs: f32,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            min_pitch_average_hz: 1_500.0,
            min_pitch_peak_hz: 2_000.0,
            min_interval_secs: 1.0,
            window_secs: 0.25,
        }
    }
}
