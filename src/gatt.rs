use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::GattBackend,
    connection::{ConnectionManager, SessionSlot},
    error::{BuzzerError, Result},
    protocol::ENABLE_NOTIFICATION_VALUE,
    relay::EventRelay,
    types::{CharacteristicRef, Event, WriteKind},
};

/// Which events answer a write-with-response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMatch {
    /// Only a `CharacteristicChanged` notification
    Notification,
    /// Only a `CharacteristicWrite` confirmation
    Confirmation,
    /// Whichever of the two arrives first
    #[default]
    Either,
}

impl ResponseMatch {
    fn extract(self, event: Event, uuid: Uuid) -> Option<Bytes> {
        match (self, event) {
            (
                Self::Notification | Self::Either,
                Event::CharacteristicChanged {
                    characteristic,
                    value,
                },
            )
            | (
                Self::Confirmation | Self::Either,
                Event::CharacteristicWrite {
                    characteristic,
                    value,
                },
            ) if characteristic.uuid == uuid => Some(value),
            _ => None,
        }
    }
}

/// Reads and writes characteristics of the current session
///
/// Writes that expect an answer subscribe to the relay before the write is
/// submitted and resolve with the first matching event.
#[derive(Clone)]
pub struct GattIo {
    relay: EventRelay,
    backend: Arc<dyn GattBackend>,
    session: SessionSlot,
    response_timeout: Option<Duration>,
}

impl GattIo {
    /// Create an I/O layer over the sessions held by `connection`
    #[must_use]
    pub fn new(connection: &ConnectionManager, response_timeout: Option<Duration>) -> Self {
        Self {
            relay: connection.relay().clone(),
            backend: connection.backend(),
            session: connection.session_slot(),
            response_timeout,
        }
    }

    /// Write `value` and wait for the device's answer
    ///
    /// # Errors
    ///
    /// * [`BuzzerError::NotReady`] without a session
    /// * [`BuzzerError::WriteSubmissionFailure`] if the driver refuses the write
    /// * [`BuzzerError::ConnectionAborted`] on `Abort` or `Disconnected`
    /// * [`BuzzerError::Gatt`] on a hardware `Error` event
    /// * [`BuzzerError::Timeout`] if the configured response timeout elapses
    pub async fn write_with_response(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        expect: ResponseMatch,
    ) -> Result<Bytes> {
        let session = self.session.current().ok_or(BuzzerError::NotReady)?;

        let mut events = self.relay.subscribe();
        debug!("Writing {:02X?} to {}", value, characteristic.uuid);
        if !self
            .backend
            .write_characteristic(&session, characteristic, value, WriteKind::WithResponse)
        {
            warn!("Write to {} was not accepted", characteristic.uuid);
            return Err(BuzzerError::WriteSubmissionFailure);
        }

        let response = async {
            while let Some(event) = events.recv().await {
                match event {
                    event if event.is_terminal() => break,
                    Event::Error(cause) => return Err(BuzzerError::Gatt(cause)),
                    other => {
                        if let Some(value) = expect.extract(other, characteristic.uuid) {
                            debug!("Response from {}: {:02X?}", characteristic.uuid, &value[..]);
                            return Ok(value);
                        }
                    }
                }
            }
            Err(BuzzerError::ConnectionAborted)
        };

        match self.response_timeout {
            Some(limit) => timeout(limit, response).await.map_err(|_| BuzzerError::Timeout {
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
            None => response.await,
        }
    }

    /// Write `value` without waiting for completion
    ///
    /// Returns whether the driver accepted the request.
    pub fn write_ignore_response(&self, characteristic: &CharacteristicRef, value: &[u8]) -> bool {
        let Some(session) = self.session.current() else {
            return false;
        };
        debug!("Writing {:02X?} to {} (no response)", value, characteristic.uuid);
        self.backend
            .write_characteristic(&session, characteristic, value, WriteKind::WithoutResponse)
    }

    /// Enable notifications and write the enable value to the configuration
    /// descriptor `descriptor`
    pub fn enable_notifications(&self, characteristic: &CharacteristicRef, descriptor: Uuid) -> bool {
        let Some(session) = self.session.current() else {
            return false;
        };
        if !self
            .backend
            .set_characteristic_notification(&session, characteristic, true)
        {
            warn!("Could not enable notifications on {}", characteristic.uuid);
            return false;
        }
        self.backend.write_descriptor(
            &session,
            &characteristic.descriptor(descriptor),
            &ENABLE_NOTIFICATION_VALUE,
        )
    }
}
