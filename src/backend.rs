use uuid::Uuid;

use crate::{
    error::Result,
    types::{
        CharacteristicRef, ConnectOptions, DescriptorRef, DeviceRef, ScanFilter, SessionRef,
        WriteKind,
    },
};

/// Hardware side of the BLE stack
///
/// Every method only *submits* a request and returns immediately. Completion
/// is reported by publishing the matching [`Event`](crate::Event) on the
/// relay the backend was built with, possibly from another thread. Callers
/// subscribe to the relay before submitting so no completion can be missed.
pub trait GattBackend: Send + Sync {
    /// Start discovery; a match is reported with `ScanFound`, a failure with
    /// `ScanFailed`
    ///
    /// # Errors
    ///
    /// Returns an error if the scan request could not be submitted.
    fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop discovery
    fn stop_scan(&self);

    /// Open a GATT link; reported with `Connected` or `Error`
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown or the request was refused.
    fn connect_gatt(&self, device: &DeviceRef, options: ConnectOptions) -> Result<()>;

    /// Discover services; reported with `ServicesDiscovered`
    fn discover_services(&self, session: &SessionRef) -> bool;

    /// Look up a characteristic among the discovered services
    fn find_characteristic(
        &self,
        session: &SessionRef,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicRef>;

    /// Submit a characteristic write; returns whether the driver accepted it
    fn write_characteristic(
        &self,
        session: &SessionRef,
        characteristic: &CharacteristicRef,
        value: &[u8],
        kind: WriteKind,
    ) -> bool;

    /// Toggle local delivery of notifications for a characteristic
    fn set_characteristic_notification(
        &self,
        session: &SessionRef,
        characteristic: &CharacteristicRef,
        enable: bool,
    ) -> bool;

    /// Submit a descriptor write; returns whether the driver accepted it
    fn write_descriptor(&self, session: &SessionRef, descriptor: &DescriptorRef, value: &[u8])
        -> bool;

    /// Ask the peripheral to drop the link; reported with `Disconnected`
    fn disconnect(&self, session: &SessionRef);

    /// Release the session's hardware handle
    fn close(&self, session: &SessionRef);
}
