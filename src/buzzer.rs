use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::Authenticator,
    backend::GattBackend,
    ble::BtleplugBackend,
    connection::{Connection, ConnectionManager},
    error::{BuzzerError, Result},
    gatt::GattIo,
    protocol::{
        ALERT_CHAR_UUID, ALERT_SERVICE_UUID, AUTH_CHAR_UUID, AUTH_SERVICE_UUID, VIBRATE_OFF,
        VIBRATE_ON,
    },
    relay::EventRelay,
    types::{BuzzerConfig, BuzzerEvent, CharacteristicRef, SessionRef},
};

/// Callback receiving buzzer lifecycle events
pub type Listener = Arc<dyn Fn(BuzzerEvent) + Send + Sync>;

/// Something that can vibrate to alert the user
///
/// Every command is best-effort: failures are logged and never surfaced to
/// the caller. Lifecycle changes are reported to the listener passed to
/// [`open`](Buzzer::open).
pub trait Buzzer: Send + Sync {
    /// Human readable name of the buzzer
    fn name(&self) -> &str;

    /// Whether [`buzz`](Buzzer::buzz) would currently reach the hardware
    fn ready(&self) -> bool;

    /// Start connecting; `Ready` is reported once the buzzer can vibrate
    fn open(&self, listener: Option<Listener>);

    /// Release the buzzer; `Closed` is reported once it is gone
    fn close(&self);

    /// Vibrate, stopping after `duration_ms` unless it is zero
    fn buzz(&self, duration_ms: u64);

    /// Stop vibrating
    fn mute(&self);
}

fn notify(listener: Option<&Listener>, event: BuzzerEvent) {
    if let Some(listener) = listener {
        listener(event);
    }
}

/// Holds the alert characteristic of the current link
///
/// Each link gets a generation so that a link which was already replaced
/// cannot publish or clear a characteristic.
#[derive(Clone, Default)]
struct AlertSlot(Arc<Mutex<(u64, Option<CharacteristicRef>)>>);

impl AlertSlot {
    /// Forget the held characteristic and start a new generation
    fn invalidate(&self) -> u64 {
        let mut slot = self.lock();
        slot.0 += 1;
        slot.1 = None;
        slot.0
    }

    fn set(&self, generation: u64, characteristic: CharacteristicRef) -> bool {
        let mut slot = self.lock();
        if slot.0 == generation {
            slot.1 = Some(characteristic);
            true
        } else {
            false
        }
    }

    fn clear_if(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.0 == generation {
            slot.1 = None;
        }
    }

    fn current(&self) -> Option<CharacteristicRef> {
        self.lock().1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (u64, Option<CharacteristicRef>)> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Vibration alerts on a Mi Band 2
///
/// # Examples
///
/// ```no_run
/// use bandalert::{BandBuzzer, Buzzer, BuzzerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let band = BandBuzzer::new(BuzzerConfig::default()).await?;
///
///     // pair once so the band accepts alerts
///     band.authenticate_and_wait().await?;
///
///     band.open(None);
///     // ... once ready
///     band.buzz(1_000);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct BandBuzzer {
    config: BuzzerConfig,
    connection: ConnectionManager,
    io: GattIo,
    alert: AlertSlot,
}

impl BandBuzzer {
    /// Create a buzzer using the first Bluetooth adapter of this host
    ///
    /// # Errors
    ///
    /// Returns [`BuzzerError::AdapterNotFound`] if the host has no adapter, or
    /// [`BuzzerError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new(config: BuzzerConfig) -> Result<Self> {
        let relay = EventRelay::new();
        let backend = BtleplugBackend::new(relay.clone()).await?;
        Ok(Self::with_backend(config, relay, Arc::new(backend)))
    }

    /// Create a buzzer driving an existing backend
    ///
    /// `relay` must be the relay `backend` publishes its completions to.
    #[must_use]
    pub fn with_backend(
        config: BuzzerConfig,
        relay: EventRelay,
        backend: Arc<dyn GattBackend>,
    ) -> Self {
        let connection = ConnectionManager::new(relay, backend);
        let io = GattIo::new(&connection, config.response_timeout());
        Self {
            config,
            connection,
            io,
            alert: AlertSlot::default(),
        }
    }

    /// The connection manager owning the link to the band
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Configuration this buzzer was built with
    #[must_use]
    pub const fn config(&self) -> &BuzzerConfig {
        &self.config
    }

    /// Run the pairing handshake in the background
    ///
    /// The listener receives `Ready` once the auth characteristic is found,
    /// then `Authenticated` or `Error`, then `Closed` after the band was
    /// disconnected.
    pub fn authenticate(&self, listener: Option<Listener>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("Cannot authenticate outside a tokio runtime");
            notify(listener.as_ref(), BuzzerEvent::Error(BuzzerError::RuntimeUnavailable));
            return;
        };

        self.alert.invalidate();
        let mut connection = {
            let _entered = runtime.enter();
            self.connection.connect(&self.config.device_name)
        };

        let this = self.clone();
        runtime.spawn(async move {
            match this.handshake(&mut connection, listener.as_ref()).await {
                Ok(()) => notify(listener.as_ref(), BuzzerEvent::Authenticated),
                Err(e) => {
                    warn!("Authentication failed: {}", e);
                    notify(listener.as_ref(), BuzzerEvent::Error(e));
                }
            }
            this.connection.disconnect();
            while connection.next_ready().await.is_some() {}
            notify(listener.as_ref(), BuzzerEvent::Closed);
        });
    }

    /// Run the pairing handshake and wait for its outcome
    ///
    /// The band is disconnected afterwards whether or not it succeeded.
    ///
    /// # Errors
    ///
    /// Returns the connection error if the band cannot be reached,
    /// [`BuzzerError::MissingCharacteristic`] if it lacks the auth service,
    /// and the failing step's error if the handshake is rejected.
    pub async fn authenticate_and_wait(&self) -> Result<()> {
        self.alert.invalidate();
        let mut connection = self.connection.connect(&self.config.device_name);
        let result = self.handshake(&mut connection, None).await;
        self.connection.disconnect();
        result
    }

    async fn handshake(&self, connection: &mut Connection, listener: Option<&Listener>) -> Result<()> {
        let session = connection
            .next_ready()
            .await
            .ok_or(BuzzerError::ConnectionAborted)??;
        let characteristic = self.characteristic(&session, AUTH_SERVICE_UUID, AUTH_CHAR_UUID)?;
        notify(listener, BuzzerEvent::Ready);

        Authenticator::new(self.io.clone())
            .authenticate(&characteristic)
            .await?;
        info!("Band authenticated");
        Ok(())
    }

    fn characteristic(
        &self,
        session: &SessionRef,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef> {
        self.connection
            .backend()
            .find_characteristic(session, service, characteristic)
            .ok_or(BuzzerError::MissingCharacteristic {
                service,
                characteristic,
            })
    }

    async fn hold_alert(self, mut connection: Connection, generation: u64, listener: Option<Listener>) {
        while let Some(item) = connection.next_ready().await {
            let characteristic = item.and_then(|session| {
                self.characteristic(&session, ALERT_SERVICE_UUID, ALERT_CHAR_UUID)
            });
            match characteristic {
                Ok(characteristic) => {
                    if self.alert.set(generation, characteristic) {
                        info!("Alert characteristic ready");
                        notify(listener.as_ref(), BuzzerEvent::Ready);
                    }
                }
                Err(e) => {
                    warn!("Opening the alert link failed: {}", e);
                    notify(listener.as_ref(), BuzzerEvent::Error(e));
                    break;
                }
            }
        }

        self.alert.clear_if(generation);
        drop(connection);
        debug!("Alert link #{} closed", generation);
        notify(listener.as_ref(), BuzzerEvent::Closed);
    }
}

impl Buzzer for BandBuzzer {
    fn name(&self) -> &str {
        &self.config.device_name
    }

    fn ready(&self) -> bool {
        self.alert.current().is_some() && self.connection.is_connected()
    }

    fn open(&self, listener: Option<Listener>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("Cannot open {} outside a tokio runtime", self.config.device_name);
            notify(listener.as_ref(), BuzzerEvent::Error(BuzzerError::RuntimeUnavailable));
            return;
        };

        let generation = self.alert.invalidate();
        let connection = {
            let _entered = runtime.enter();
            self.connection.connect(&self.config.device_name)
        };
        runtime.spawn(self.clone().hold_alert(connection, generation, listener));
    }

    fn close(&self) {
        self.alert.invalidate();
        self.connection.disconnect();
    }

    fn buzz(&self, duration_ms: u64) {
        let Some(alert) = self.alert.current() else {
            debug!("Buzz ignored, not ready");
            return;
        };

        if !self.io.write_ignore_response(&alert, &VIBRATE_ON) {
            warn!("Vibration start was not accepted");
        }
        if duration_ms == 0 {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("Cannot schedule vibration stop outside a tokio runtime");
            return;
        };
        let io = self.io.clone();
        runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            if !io.write_ignore_response(&alert, &VIBRATE_OFF) {
                debug!("Vibration stop was not accepted");
            }
        });
    }

    fn mute(&self) {
        let Some(alert) = self.alert.current() else {
            debug!("Mute ignored, not ready");
            return;
        };
        if !self.io.write_ignore_response(&alert, &VIBRATE_OFF) {
            warn!("Mute was not accepted");
        }
    }
}
