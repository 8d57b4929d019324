use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter as CentralScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::{future::BoxFuture, stream::StreamExt, FutureExt, Stream};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::GattBackend,
    error::{BuzzerError, Result},
    protocol::{AUTH_NOTIFICATION_DESC_UUID, ENABLE_NOTIFICATION_VALUE},
    relay::EventRelay,
    types::{
        CharacteristicRef, ConnectOptions, DescriptorRef, DeviceRef, Event, ScanFilter,
        SessionRef, WriteKind,
    },
};

/// Scan failure code published when the adapter refuses to start scanning
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

const fn write_type(kind: WriteKind) -> WriteType {
    match kind {
        WriteKind::WithResponse => WriteType::WithResponse,
        WriteKind::WithoutResponse => WriteType::WithoutResponse,
    }
}

fn enables_notifications(descriptor: &DescriptorRef, value: &[u8]) -> bool {
    descriptor.uuid == AUTH_NOTIFICATION_DESC_UUID && value == ENABLE_NOTIFICATION_VALUE
}

fn find_characteristic(peripheral: &Peripheral, characteristic: &CharacteristicRef) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == characteristic.service && c.uuid == characteristic.uuid)
}

/// Runs hardware operations one at a time, in submission order
///
/// A stop never overtakes the scan start it cancels, and a write never
/// overtakes the subscription submitted before it.
struct OperationQueue {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    worker: JoinHandle<()>,
}

impl OperationQueue {
    fn start(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let worker = runtime.spawn(async move {
            while let Some(operation) = rx.recv().await {
                operation.await;
            }
            debug!("Operation queue closed");
        });
        Self { tx, worker }
    }

    fn submit(&self, operation: impl Future<Output = ()> + Send + 'static) {
        if self.tx.send(operation.boxed()).is_err() {
            debug!("Operation queue closed, dropping submission");
        }
    }

    fn shutdown(&self) {
        self.worker.abort();
    }
}

/// One connected peripheral
struct Link {
    peripheral: Peripheral,
    disconnected: bool,
    notifications: JoinHandle<()>,
}

struct Shared {
    adapter: Adapter,
    relay: EventRelay,
    runtime: Handle,
    operations: OperationQueue,
    wanted: Mutex<Option<String>>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    links: Mutex<HashMap<u64, Link>>,
    next_session: AtomicU64,
}

impl Shared {
    fn submit(&self, operation: impl Future<Output = ()> + Send + 'static) {
        self.operations.submit(operation);
    }

    fn peripheral_for(&self, session: &SessionRef) -> Option<Peripheral> {
        lock(&self.links)
            .get(&session.id)
            .map(|link| link.peripheral.clone())
    }

    /// Report `peripheral` if it is the device the running scan looks for
    async fn offer(&self, peripheral: Peripheral) {
        let wanted = lock(&self.wanted).clone();
        let Some(wanted) = wanted else { return };

        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            Ok(None) => return,
            Err(e) => {
                debug!("Reading advertisement failed: {}", e);
                return;
            }
        };
        if name.as_deref() != Some(wanted.as_str()) {
            return;
        }

        // first match per scan only
        {
            let mut current = lock(&self.wanted);
            if current.as_deref() != Some(wanted.as_str()) {
                return;
            }
            *current = None;
        }

        let id = peripheral.id().to_string();
        info!("Found {} at {}", wanted, id);
        lock(&self.peripherals).insert(id.clone(), peripheral);
        self.relay.publish(Event::ScanFound(DeviceRef::new(id, name)));
    }

    /// Publish `Disconnected` once for session `id`
    fn mark_disconnected(&self, id: u64) {
        let first = lock(&self.links).get_mut(&id).is_some_and(|link| {
            let first = !link.disconnected;
            link.disconnected = true;
            first
        });
        if first {
            debug!("Session #{} disconnected", id);
            self.relay.publish(Event::Disconnected);
        }
    }

    fn peripheral_lost(&self, peripheral_id: &str) {
        let sessions: Vec<u64> = lock(&self.links)
            .iter()
            .filter(|(_, link)| link.peripheral.id().to_string() == peripheral_id)
            .map(|(id, _)| *id)
            .collect();
        for id in sessions {
            self.mark_disconnected(id);
        }
    }
}

async fn pump_central_events(
    shared: Arc<Shared>,
    mut events: impl Stream<Item = CentralEvent> + Send + Unpin,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Ok(peripheral) = shared.adapter.peripheral(&id).await {
                    shared.offer(peripheral).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => shared.peripheral_lost(&id.to_string()),
            _ => {}
        }
    }
    debug!("Central event stream ended");
}

async fn pump_notifications(
    relay: EventRelay,
    peripheral: Peripheral,
    mut notifications: impl Stream<Item = btleplug::api::ValueNotification> + Send + Unpin,
) {
    while let Some(notification) = notifications.next().await {
        let service = peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == notification.uuid)
            .map_or_else(Uuid::nil, |c| c.service_uuid);
        debug!(
            "Notification from {}: {:02X?}",
            notification.uuid, notification.value
        );
        relay.publish(Event::CharacteristicChanged {
            characteristic: CharacteristicRef::new(service, notification.uuid),
            value: Bytes::from(notification.value),
        });
    }
    debug!("Notification stream ended");
}

/// [`GattBackend`] on top of the host Bluetooth stack via btleplug
///
/// Submissions run one after another on the tokio runtime the backend was
/// created on, and their completions are published to the relay.
pub struct BtleplugBackend {
    shared: Arc<Shared>,
    central_events: JoinHandle<()>,
}

impl BtleplugBackend {
    /// Open the first Bluetooth adapter and start listening to its events
    ///
    /// # Errors
    ///
    /// Returns [`BuzzerError::AdapterNotFound`] if the host has no adapter,
    /// [`BuzzerError::RuntimeUnavailable`] outside a tokio runtime, or
    /// [`BuzzerError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new(relay: EventRelay) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| BuzzerError::RuntimeUnavailable)?;
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BuzzerError::AdapterNotFound)?;
        let events = adapter.events().await?;

        let shared = Arc::new(Shared {
            adapter,
            relay,
            runtime: runtime.clone(),
            operations: OperationQueue::start(&runtime),
            wanted: Mutex::new(None),
            peripherals: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        });
        let central_events = runtime.spawn(pump_central_events(shared.clone(), events));

        Ok(Self {
            shared,
            central_events,
        })
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        self.central_events.abort();
        self.shared.operations.shutdown();
        for (_, link) in lock(&self.shared.links).drain() {
            link.notifications.abort();
        }
    }
}

impl GattBackend for BtleplugBackend {
    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        *lock(&self.shared.wanted) = Some(filter.device_name.clone());
        debug!("Starting {:?} scan for {}", filter.mode, filter.device_name);

        let shared = self.shared.clone();
        self.shared.submit(async move {
            if let Err(e) = shared.adapter.start_scan(CentralScanFilter::default()).await {
                warn!("Starting scan failed: {}", e);
                shared.relay.publish(Event::ScanFailed(SCAN_FAILED_INTERNAL_ERROR));
                return;
            }
            // devices seen before this scan do not report a discovery again
            if let Ok(known) = shared.adapter.peripherals().await {
                for peripheral in known {
                    shared.offer(peripheral).await;
                }
            }
        });
        Ok(())
    }

    fn stop_scan(&self) {
        *lock(&self.shared.wanted) = None;
        let shared = self.shared.clone();
        self.shared.submit(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                debug!("Stopping scan failed: {}", e);
            }
        });
    }

    fn connect_gatt(&self, device: &DeviceRef, options: ConnectOptions) -> Result<()> {
        let peripheral = lock(&self.shared.peripherals)
            .get(&device.id)
            .cloned()
            .ok_or_else(|| BuzzerError::DeviceNotFound(device.id.clone()))?;
        if options.auto_connect {
            debug!("Automatic reconnection is not supported, connecting directly");
        }

        let shared = self.shared.clone();
        let device = device.clone();
        self.shared.submit(async move {
            let connected = async {
                peripheral.connect().await?;
                peripheral.notifications().await
            };
            let notifications = match connected.await {
                Ok(notifications) => notifications,
                Err(e) => {
                    warn!("Connecting to {} failed: {}", device.id, e);
                    shared.relay.publish(Event::Error(e.to_string()));
                    return;
                }
            };

            let id = shared.next_session.fetch_add(1, Ordering::SeqCst);
            let pump = shared.runtime.spawn(pump_notifications(
                shared.relay.clone(),
                peripheral.clone(),
                notifications,
            ));
            lock(&shared.links).insert(
                id,
                Link {
                    peripheral,
                    disconnected: false,
                    notifications: pump,
                },
            );
            info!("Connected to {} as session #{}", device.id, id);
            shared.relay.publish(Event::Connected(SessionRef { id, device }));
        });
        Ok(())
    }

    fn discover_services(&self, session: &SessionRef) -> bool {
        let Some(peripheral) = self.shared.peripheral_for(session) else {
            return false;
        };
        let shared = self.shared.clone();
        let session = session.clone();
        self.shared.submit(async move {
            match peripheral.discover_services().await {
                Ok(()) => shared.relay.publish(Event::ServicesDiscovered(session)),
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    shared.relay.publish(Event::Error(e.to_string()));
                }
            }
        });
        true
    }

    fn find_characteristic(
        &self,
        session: &SessionRef,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicRef> {
        let wanted = CharacteristicRef::new(service, characteristic);
        let peripheral = self.shared.peripheral_for(session)?;
        find_characteristic(&peripheral, &wanted).map(|_| wanted)
    }

    fn write_characteristic(
        &self,
        session: &SessionRef,
        characteristic: &CharacteristicRef,
        value: &[u8],
        kind: WriteKind,
    ) -> bool {
        let Some(peripheral) = self.shared.peripheral_for(session) else {
            return false;
        };
        let Some(target) = find_characteristic(&peripheral, characteristic) else {
            return false;
        };

        let shared = self.shared.clone();
        let characteristic = *characteristic;
        let value = Bytes::copy_from_slice(value);
        self.shared.submit(async move {
            match peripheral.write(&target, &value, write_type(kind)).await {
                Ok(()) if kind == WriteKind::WithResponse => {
                    shared.relay.publish(Event::CharacteristicWrite {
                        characteristic,
                        value,
                    });
                }
                Ok(()) => {}
                Err(e) if kind == WriteKind::WithResponse => {
                    warn!("Write to {} failed: {}", characteristic.uuid, e);
                    shared.relay.publish(Event::Error(e.to_string()));
                }
                Err(e) => debug!("Write to {} failed: {}", characteristic.uuid, e),
            }
        });
        true
    }

    fn set_characteristic_notification(
        &self,
        session: &SessionRef,
        characteristic: &CharacteristicRef,
        enable: bool,
    ) -> bool {
        let Some(peripheral) = self.shared.peripheral_for(session) else {
            return false;
        };
        let Some(target) = find_characteristic(&peripheral, characteristic) else {
            return false;
        };
        if !target
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return false;
        }

        // enabling happens with the configuration descriptor write
        if !enable {
            self.shared.submit(async move {
                if let Err(e) = peripheral.unsubscribe(&target).await {
                    debug!("Unsubscribing from {} failed: {}", target.uuid, e);
                }
            });
        }
        true
    }

    fn write_descriptor(&self, session: &SessionRef, descriptor: &DescriptorRef, value: &[u8]) -> bool {
        let Some(peripheral) = self.shared.peripheral_for(session) else {
            return false;
        };
        let Some(target) = find_characteristic(&peripheral, &descriptor.characteristic) else {
            return false;
        };

        let shared = self.shared.clone();
        let descriptor = *descriptor;
        if enables_notifications(&descriptor, value) {
            self.shared.submit(async move {
                match peripheral.subscribe(&target).await {
                    Ok(()) => shared.relay.publish(Event::DescriptorWrite(descriptor)),
                    Err(e) => {
                        warn!("Subscribing to {} failed: {}", target.uuid, e);
                        shared.relay.publish(Event::Error(e.to_string()));
                    }
                }
            });
            return true;
        }

        let Some(raw) = target
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor.uuid)
            .cloned()
        else {
            return false;
        };
        let value = value.to_vec();
        self.shared.submit(async move {
            match peripheral.write_descriptor(&raw, &value).await {
                Ok(()) => shared.relay.publish(Event::DescriptorWrite(descriptor)),
                Err(e) => shared.relay.publish(Event::Error(e.to_string())),
            }
        });
        true
    }

    fn disconnect(&self, session: &SessionRef) {
        let Some(peripheral) = self.shared.peripheral_for(session) else {
            return;
        };
        let shared = self.shared.clone();
        let id = session.id;
        self.shared.submit(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
            shared.mark_disconnected(id);
        });
    }

    fn close(&self, session: &SessionRef) {
        let Some(link) = lock(&self.shared.links).remove(&session.id) else {
            return;
        };
        link.notifications.abort();
        if !link.disconnected {
            let peripheral = link.peripheral;
            self.shared.submit(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect on close failed: {}", e);
                }
            });
        }
        debug!("Session #{} closed", session.id);
    }
}
