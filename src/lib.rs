#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bandalert ⌚
//!
//! Vibrate a Mi Band 2 wrist band over Bluetooth Low Energy when a loud,
//! high-pitched sound is detected.
//!
//! The crate is layered bottom-up:
//!
//! - **Event relay**: every hardware completion is published as an [`Event`]
//!   and fanned out, in order, to whoever subscribed before it happened
//! - **Scanner and connection manager**: the scan/connect/discover state
//!   machine holding at most one GATT session
//! - **Characteristic I/O**: writes matched to the notification or
//!   confirmation that answers them
//! - **Authentication**: the band's three step AES challenge/response
//! - **Buzzer**: vibration on the band's alert characteristic
//! - **Sound alert**: pitch thresholds deciding when to buzz
//!
//! The hardware sits behind the [`GattBackend`] trait; [`BtleplugBackend`]
//! drives the host's Bluetooth stack.
//!
//! ## Pairing
//!
//! A band only accepts alerts from a host that completed the handshake once:
//!
//! ```no_run
//! use bandalert::{BandBuzzer, BuzzerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let band = BandBuzzer::new(BuzzerConfig::default()).await?;
//!     band.authenticate_and_wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Alerting
//!
//! ```no_run
//! use std::sync::Arc;
//! use bandalert::{BandBuzzer, BuzzerConfig, DetectionPolicy, PitchSample, SoundAlert};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BuzzerConfig::default();
//!     let band = Arc::new(BandBuzzer::new(config.clone()).await?);
//!
//!     let mut alert = SoundAlert::new(band, DetectionPolicy::default(), config.buzz_duration_ms);
//!     alert.open(None);
//!
//!     // frames come from a pitch detector
//!     alert.observe(&PitchSample::pitched(1.20, 1.25, 2_400.0));
//!
//!     alert.close();
//!     Ok(())
//! }
//! ```

/// Pitch thresholds driving buzzer alerts
pub mod alert;
/// Pairing handshake
pub mod auth;
/// Hardware seam driven by the BLE layers
pub mod backend;
/// btleplug implementation of the hardware seam
pub mod ble;
/// Vibration commands
pub mod buzzer;
/// GATT connection state machine
pub mod connection;
/// Detector frame filtering
pub mod detection;
/// Error types and handling
pub mod error;
/// Characteristic reads, writes and notifications
pub mod gatt;
/// Wire constants and handshake encoding
pub mod protocol;
/// In-order event fan out
pub mod relay;
/// Device discovery
pub mod scan;
/// Type definitions and configuration
pub mod types;

#[cfg(test)]
mod mock;

// Re-export the main types for convenient usage
pub use alert::SoundAlert;
pub use auth::Authenticator;
pub use backend::GattBackend;
pub use ble::BtleplugBackend;
pub use buzzer::{BandBuzzer, Buzzer, Listener};
pub use connection::{Connection, ConnectionManager, SessionSlot};
pub use detection::{PitchFilter, PitchSample};
pub use error::{BuzzerError, Result};
pub use gatt::{GattIo, ResponseMatch};
pub use protocol::AuthStep;
pub use relay::{EventRelay, Subscription};
pub use scan::{ScanOutcome, Scanner};
pub use types::{
    BuzzerConfig, BuzzerEvent, CharacteristicRef, ConnectOptions, ConnectionState,
    DescriptorRef, DetectionPolicy, DeviceRef, Event, ScanFilter, ScanMode, SessionRef,
    WriteKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
