use bytes::Bytes;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    backend::GattBackend,
    error::{BuzzerError, Result},
    protocol::{self, ALERT_CHAR_UUID, ALERT_SERVICE_UUID, AUTH_CHAR_UUID, AUTH_SERVICE_UUID},
    relay::EventRelay,
    types::{
        CharacteristicRef, ConnectOptions, DescriptorRef, DeviceRef, Event, ScanFilter,
        SessionRef, WriteKind,
    },
};

pub(crate) const CHALLENGE: [u8; 16] = [
    0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    StartScan(String),
    StopScan,
    ConnectGatt(String),
    DiscoverServices(u64),
    Write {
        uuid: Uuid,
        value: Vec<u8>,
        kind: WriteKind,
    },
    SetNotification(Uuid, bool),
    WriteDescriptor(Uuid, Vec<u8>),
    Disconnect(u64),
    Close(u64),
}

type Responder = Box<dyn FnMut(&Call) -> Vec<Event> + Send>;

pub(crate) struct MockBackend {
    relay: EventRelay,
    calls: Mutex<Vec<(Instant, Call)>>,
    responder: Mutex<Option<Responder>>,
    pub(crate) accept_writes: AtomicBool,
    pub(crate) accept_notifications: AtomicBool,
    pub(crate) expose_characteristics: AtomicBool,
    pub(crate) accept_scans: AtomicBool,
    next_session: AtomicU64,
}

impl MockBackend {
    /// A backend that records calls and never answers
    pub(crate) fn silent(relay: &EventRelay) -> Self {
        Self {
            relay: relay.clone(),
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            accept_writes: AtomicBool::new(true),
            accept_notifications: AtomicBool::new(true),
            expose_characteristics: AtomicBool::new(true),
            accept_scans: AtomicBool::new(true),
            next_session: AtomicU64::new(1),
        }
    }

    /// A backend whose answers are produced by `responder`
    pub(crate) fn scripted(
        relay: &EventRelay,
        responder: impl FnMut(&Call) -> Vec<Event> + Send + 'static,
    ) -> Self {
        let backend = Self::silent(relay);
        *backend.responder.lock().unwrap() = Some(Box::new(responder));
        backend
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub(crate) fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write { value, .. } => Some(value),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), call.clone()));
        let events = self
            .responder
            .lock()
            .unwrap()
            .as_mut()
            .map(|respond| respond(&call))
            .unwrap_or_default();
        for event in events {
            self.relay.publish(event);
        }
    }

    fn session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }
}

impl GattBackend for MockBackend {
    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        self.record(Call::StartScan(filter.device_name.clone()));
        if !self.accept_scans.load(Ordering::SeqCst) {
            return Err(BuzzerError::AdapterNotFound);
        }
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(Call::StopScan);
    }

    fn connect_gatt(&self, device: &DeviceRef, _options: ConnectOptions) -> Result<()> {
        if device.id.is_empty() {
            return Err(BuzzerError::DeviceNotFound(device.id.clone()));
        }
        self.record(Call::ConnectGatt(device.id.clone()));
        Ok(())
    }

    fn discover_services(&self, session: &SessionRef) -> bool {
        self.record(Call::DiscoverServices(session.id));
        true
    }

    fn find_characteristic(
        &self,
        _session: &SessionRef,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicRef> {
        if !self.expose_characteristics.load(Ordering::SeqCst) {
            return None;
        }
        let known = (service == AUTH_SERVICE_UUID && characteristic == AUTH_CHAR_UUID)
            || (service == ALERT_SERVICE_UUID && characteristic == ALERT_CHAR_UUID);
        known.then(|| CharacteristicRef::new(service, characteristic))
    }

    fn write_characteristic(
        &self,
        _session: &SessionRef,
        characteristic: &CharacteristicRef,
        value: &[u8],
        kind: WriteKind,
    ) -> bool {
        if !self.accept_writes.load(Ordering::SeqCst) {
            return false;
        }
        self.record(Call::Write {
            uuid: characteristic.uuid,
            value: value.to_vec(),
            kind,
        });
        true
    }

    fn set_characteristic_notification(
        &self,
        _session: &SessionRef,
        characteristic: &CharacteristicRef,
        enable: bool,
    ) -> bool {
        self.record(Call::SetNotification(characteristic.uuid, enable));
        self.accept_notifications.load(Ordering::SeqCst)
    }

    fn write_descriptor(&self, _session: &SessionRef, descriptor: &DescriptorRef, value: &[u8]) -> bool {
        self.record(Call::WriteDescriptor(descriptor.uuid, value.to_vec()));
        true
    }

    fn disconnect(&self, session: &SessionRef) {
        self.record(Call::Disconnect(session.id));
    }

    fn close(&self, session: &SessionRef) {
        self.record(Call::Close(session.id));
    }
}

pub(crate) fn device() -> DeviceRef {
    DeviceRef::new("band-1", Some(protocol::DEVICE_NAME.to_string()))
}

pub(crate) fn changed(uuid: Uuid, value: &[u8]) -> Event {
    Event::CharacteristicChanged {
        characteristic: CharacteristicRef::new(AUTH_SERVICE_UUID, uuid),
        value: Bytes::copy_from_slice(value),
    }
}

/// Answers like a well behaved band: scans, connects, discovers, walks
/// through the handshake and reports disconnections.
pub(crate) fn band_responder() -> impl FnMut(&Call) -> Vec<Event> + Send + 'static {
    let mut next_session = 0;
    move |call| match call {
        Call::StartScan(_) => vec![Event::ScanFound(device())],
        Call::ConnectGatt(id) => {
            next_session += 1;
            vec![Event::Connected(SessionRef {
                id: next_session,
                device: DeviceRef::new(id.clone(), Some(protocol::DEVICE_NAME.to_string())),
            })]
        }
        Call::DiscoverServices(id) => vec![Event::ServicesDiscovered(SessionRef {
            id: *id,
            device: device(),
        })],
        Call::Write { uuid, value, .. } if *uuid == AUTH_CHAR_UUID => match value.first() {
            Some(&protocol::AUTH_SEND_KEY) => {
                vec![changed(AUTH_CHAR_UUID, &protocol::success_response(protocol::AUTH_SEND_KEY))]
            }
            Some(&protocol::AUTH_REQUEST_RANDOM) => {
                let mut response = protocol::success_response(protocol::AUTH_REQUEST_RANDOM).to_vec();
                response.extend_from_slice(&CHALLENGE);
                vec![changed(AUTH_CHAR_UUID, &response)]
            }
            Some(&protocol::AUTH_SEND_ENCRYPTED) => {
                let expected = protocol::encrypt_challenge(&protocol::AUTH_SECRET_KEY, &CHALLENGE);
                let status = if value[2..] == expected {
                    protocol::AUTH_SUCCESS
                } else {
                    protocol::AUTH_FAIL
                };
                vec![changed(
                    AUTH_CHAR_UUID,
                    &[protocol::AUTH_RESPONSE, protocol::AUTH_SEND_ENCRYPTED, status],
                )]
            }
            _ => Vec::new(),
        },
        Call::Disconnect(_) => vec![Event::Disconnected],
        _ => Vec::new(),
    }
}

/// Let spawned tasks run until they block on the relay again
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
