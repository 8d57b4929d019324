use futures::Stream;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::GattBackend,
    error::{BuzzerError, Result},
    relay::{EventRelay, Subscription},
    scan::{ScanOutcome, Scanner},
    types::{ConnectOptions, ConnectionState, Event, SessionRef},
};

/// The single slot holding the current session reference
///
/// Written only by the connection manager; readers copy the reference out.
#[derive(Clone, Default)]
pub struct SessionSlot(Arc<Mutex<Option<SessionRef>>>);

impl SessionSlot {
    /// Copy out the current session
    #[must_use]
    pub fn current(&self) -> Option<SessionRef> {
        self.lock().clone()
    }

    /// Whether a session is held
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    fn set(&self, session: SessionRef) {
        *self.lock() = Some(session);
    }

    fn take(&self) -> Option<SessionRef> {
        self.lock().take()
    }

    /// Clear the slot only if it still refers to `session`
    fn clear_if(&self, session: &SessionRef) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|held| held.id == session.id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionRef>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Shared {
    relay: EventRelay,
    backend: Arc<dyn GattBackend>,
    scanner: Scanner,
    session: SessionSlot,
    state: watch::Sender<ConnectionState>,
    options: ConnectOptions,
    epoch: AtomicU64,
}

impl Shared {
    /// Update the state on behalf of connection attempt `epoch`, unless a
    /// newer attempt has started since
    fn set_state_for(&self, epoch: u64, state: ConnectionState) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.set_state(state);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    fn disconnect(&self) {
        self.scanner.stop();
        self.relay.publish(Event::Abort);
        if let Some(session) = self.session.take() {
            info!("Disconnecting session #{}", session.id);
            self.set_state(ConnectionState::Aborting);
            self.backend.disconnect(&session);
        }
    }
}

/// Owns the single GATT connection to the band
///
/// Every [`connect`](Self::connect) first tears down whatever was there, so
/// at most one connection attempt is ever in flight.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager driving `backend` and observing `relay`
    #[must_use]
    pub fn new(relay: EventRelay, backend: Arc<dyn GattBackend>) -> Self {
        Self::with_options(relay, backend, ConnectOptions::default())
    }

    /// Create a manager with explicit connect options
    #[must_use]
    pub fn with_options(
        relay: EventRelay,
        backend: Arc<dyn GattBackend>,
        options: ConnectOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                scanner: Scanner::new(relay.clone(), backend.clone()),
                relay,
                backend,
                session: SessionSlot::default(),
                state,
                options,
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Disconnect, scan for `device_name`, connect and discover services
    ///
    /// The returned stream yields a session each time service discovery
    /// completes and ends when the link goes down or is aborted. Dropping it
    /// closes the connection.
    #[must_use]
    pub fn connect(&self, device_name: &str) -> Connection {
        self.shared.disconnect();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        // taken before spawning so a disconnect racing the task start is seen
        let events = self.shared.relay.subscribe();

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let device_name = device_name.to_string();
        let task = tokio::spawn(async move {
            run_connection(shared, epoch, device_name, events, tx).await;
        });

        Connection { updates: rx, task }
    }

    /// Stop scanning, abort every dependent chain and drop the link
    ///
    /// Safe to call when nothing is connected.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// The usable session, if services have been discovered
    #[must_use]
    pub fn session(&self) -> Option<SessionRef> {
        self.shared.session.current()
    }

    /// Whether a usable session is held
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.session.is_set()
    }

    /// Whether the held session belongs to a device named `device_name`
    #[must_use]
    pub fn connected_to(&self, device_name: &str) -> bool {
        self.session()
            .is_some_and(|session| session.device.name.as_deref() == Some(device_name))
    }

    /// Current state of the connection state machine
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Handle to the slot the characteristic I/O layer reads sessions from
    #[must_use]
    pub fn session_slot(&self) -> SessionSlot {
        self.shared.session.clone()
    }

    /// The relay this manager observes
    #[must_use]
    pub fn relay(&self) -> &EventRelay {
        &self.shared.relay
    }

    /// The backend this manager drives
    #[must_use]
    pub fn backend(&self) -> Arc<dyn GattBackend> {
        self.shared.backend.clone()
    }
}

/// Stream of usable sessions produced by [`ConnectionManager::connect`]
pub struct Connection {
    updates: mpsc::UnboundedReceiver<Result<SessionRef>>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Wait for the next usable session
    ///
    /// Returns `None` once the connection has ended.
    pub async fn next_ready(&mut self) -> Option<Result<SessionRef>> {
        self.updates.recv().await
    }

    /// Whether the driving task has finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for Connection {
    type Item = Result<SessionRef>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

/// Closes the hardware handle and clears the slot exactly once
struct SessionGuard {
    shared: Arc<Shared>,
    epoch: u64,
    handle: Option<SessionRef>,
}

impl SessionGuard {
    fn hold(&mut self, session: SessionRef) {
        let id = session.id;
        if let Some(previous) = self.handle.replace(session).filter(|held| held.id != id) {
            warn!("Replacing unreleased session #{}", previous.id);
            self.shared.backend.close(&previous);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.handle.take() {
            debug!("Closing session #{}", session.id);
            self.shared.session.clear_if(&session);
            self.shared.backend.close(&session);
        }
        settle_idle(&self.shared, self.epoch);
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    epoch: u64,
    device_name: String,
    mut events: Subscription,
    tx: mpsc::UnboundedSender<Result<SessionRef>>,
) {
    shared.set_state_for(epoch, ConnectionState::Scanning);
    let scan = tokio::select! {
        outcome = shared.scanner.scan_from(&mut events, &device_name) => outcome,
        () = tx.closed() => Ok(ScanOutcome::Aborted),
    };
    let device = match scan {
        Ok(ScanOutcome::Found(device)) => device,
        Ok(ScanOutcome::Aborted) => {
            debug!("Connection to {} aborted while scanning", device_name);
            settle_idle(&shared, epoch);
            return;
        }
        Err(e) => {
            error!("Scanning for {} failed: {}", device_name, e);
            settle_idle(&shared, epoch);
            let _ = tx.send(Err(e));
            return;
        }
    };

    let mut guard = SessionGuard {
        shared: shared.clone(),
        epoch,
        handle: None,
    };

    shared.set_state_for(epoch, ConnectionState::Connecting);
    if let Err(e) = shared.backend.connect_gatt(&device, shared.options) {
        error!("Connecting to {} failed: {}", device.id, e);
        let _ = tx.send(Err(e));
        return;
    }

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = tx.closed() => {
                debug!("Connection dropped by its consumer");
                break;
            }
        };
        let Some(event) = event else { break };

        match event {
            event if event.is_terminal() => {
                info!("Connection to {} ended ({})", device.id, event);
                break;
            }
            Event::Error(cause) => {
                error!("Connection error: {}", cause);
                let _ = tx.send(Err(BuzzerError::Gatt(cause)));
                break;
            }
            Event::Connected(session) => {
                info!("Connected to {}, discovering services", device.id);
                guard.hold(session.clone());
                shared.set_state_for(epoch, ConnectionState::AwaitingServices);
                if !shared.backend.discover_services(&session) {
                    let _ = tx.send(Err(BuzzerError::Gatt(
                        "service discovery was not started".to_string(),
                    )));
                    break;
                }
            }
            Event::ServicesDiscovered(session) => {
                info!("Services discovered on session #{}", session.id);
                guard.hold(session.clone());
                shared.session.set(session.clone());
                shared.set_state_for(epoch, ConnectionState::Ready);
                if tx.send(Ok(session)).is_err() {
                    break;
                }
            }
            _ => {}
        }
    }

    drop(guard);
}

fn settle_idle(shared: &Shared, epoch: u64) {
    if !shared.session.is_set() && !shared.scanner.is_scanning() {
        shared.set_state_for(epoch, ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{band_responder, device, settle, Call, MockBackend};
    use futures::StreamExt;

    fn manager(backend: &Arc<MockBackend>, relay: &EventRelay) -> ConnectionManager {
        ConnectionManager::new(relay.clone(), backend.clone())
    }

    fn session(id: u64) -> SessionRef {
        SessionRef {
            id,
            device: device(),
        }
    }

    #[tokio::test]
    async fn test_connect_sequence() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        let ready = connection.next_ready().await.unwrap().unwrap();
        assert_eq!(ready.id, 1);
        assert!(manager.is_connected());
        assert!(manager.connected_to("MI Band 2"));
        assert_eq!(manager.state(), ConnectionState::Ready);

        assert_eq!(
            backend.calls(),
            vec![
                Call::StartScan("MI Band 2".to_string()),
                Call::StopScan,
                Call::ConnectGatt("band-1".to_string()),
                Call::DiscoverServices(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_connected_alone_is_not_surfaced() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, |call| match call {
            Call::StartScan(_) => vec![Event::ScanFound(device())],
            _ => Vec::new(),
        }));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        settle().await;
        relay.publish(Event::Connected(session(7)));
        settle().await;

        assert!(connection.updates.try_recv().is_err());
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::AwaitingServices);
        assert_eq!(backend.count(&Call::DiscoverServices(7)), 1);

        relay.publish(Event::ServicesDiscovered(session(7)));
        let ready = connection.next_ready().await.unwrap().unwrap();
        assert_eq!(ready, session(7));
    }

    #[tokio::test]
    async fn test_discovered_session_is_closed_on_disconnect() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, |call| match call {
            Call::StartScan(_) => vec![Event::ScanFound(device())],
            _ => Vec::new(),
        }));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        settle().await;
        relay.publish(Event::ServicesDiscovered(session(9)));
        assert_eq!(connection.next_ready().await.unwrap().unwrap(), session(9));
        assert!(manager.is_connected());

        relay.publish(Event::Disconnected);
        assert!(connection.next().await.is_none());
        settle().await;

        assert!(!manager.is_connected());
        assert_eq!(backend.count(&Call::Close(9)), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rediscovery_on_another_session_closes_the_first() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        assert_eq!(connection.next_ready().await.unwrap().unwrap().id, 1);

        relay.publish(Event::ServicesDiscovered(session(4)));
        assert_eq!(connection.next_ready().await.unwrap().unwrap().id, 4);
        assert_eq!(backend.count(&Call::Close(1)), 1);
        assert_eq!(manager.session(), Some(session(4)));

        manager.disconnect();
        assert!(connection.next().await.is_none());
        settle().await;
        assert_eq!(backend.count(&Call::Close(1)), 1);
        assert_eq!(backend.count(&Call::Close(4)), 1);
    }

    #[tokio::test]
    async fn test_disconnected_closes_once_and_ends_stream() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        assert!(connection.next_ready().await.unwrap().is_ok());

        relay.publish(Event::Disconnected);
        assert!(connection.next().await.is_none());
        settle().await;

        assert!(!manager.is_connected());
        assert_eq!(backend.count(&Call::Close(1)), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        relay.publish(Event::Abort);
        settle().await;
        assert_eq!(backend.count(&Call::Close(1)), 1);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        assert!(connection.next_ready().await.unwrap().is_ok());

        manager.disconnect();
        assert!(!manager.is_connected());
        assert!(connection.next_ready().await.is_none());
        settle().await;

        assert_eq!(backend.count(&Call::Disconnect(1)), 1);
        assert_eq!(backend.count(&Call::Close(1)), 1);

        // idempotent
        manager.disconnect();
        assert_eq!(backend.count(&Call::Disconnect(1)), 1);
    }

    #[tokio::test]
    async fn test_abort_during_scan_ends_without_session() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::silent(&relay));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Scanning);

        manager.disconnect();
        assert!(connection.next_ready().await.is_none());
        settle().await;

        assert_eq!(backend.count(&Call::StopScan), 1);
        assert_eq!(backend.count(&Call::ConnectGatt("band-1".to_string())), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_scan_failure_surfaces_as_error() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, |call| match call {
            Call::StartScan(_) => vec![Event::ScanFailed(1)],
            _ => Vec::new(),
        }));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        let err = connection.next_ready().await.unwrap().unwrap_err();
        assert!(matches!(err, BuzzerError::ScanFailure(1)));
        assert!(connection.next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_error_event_closes_pending_handle() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, |call| match call {
            Call::StartScan(_) => vec![Event::ScanFound(device())],
            _ => Vec::new(),
        }));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        settle().await;
        relay.publish(Event::Connected(session(3)));
        relay.publish(Event::Error("status 133".to_string()));

        let err = connection.next_ready().await.unwrap().unwrap_err();
        assert!(matches!(err, BuzzerError::Gatt(ref cause) if cause == "status 133"));
        assert!(connection.next_ready().await.is_none());
        settle().await;
        assert_eq!(backend.count(&Call::Close(3)), 1);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_connection() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut first = manager.connect("MI Band 2");
        assert_eq!(first.next_ready().await.unwrap().unwrap().id, 1);

        let mut second = manager.connect("MI Band 2");
        assert!(first.next_ready().await.is_none());
        assert_eq!(second.next_ready().await.unwrap().unwrap().id, 2);
        settle().await;

        assert_eq!(backend.count(&Call::Close(1)), 1);
        assert_eq!(manager.session().map(|s| s.id), Some(2));
    }

    #[tokio::test]
    async fn test_dropping_connection_closes_handle() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        assert!(connection.next_ready().await.unwrap().is_ok());
        drop(connection);
        settle().await;

        assert_eq!(backend.count(&Call::Close(1)), 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_before_task_runs_still_aborts() {
        let relay = EventRelay::new();
        let backend = Arc::new(MockBackend::scripted(&relay, band_responder()));
        let manager = manager(&backend, &relay);

        let mut connection = manager.connect("MI Band 2");
        manager.disconnect();

        assert!(connection.next_ready().await.is_none());
        settle().await;
        assert_eq!(backend.count(&Call::ConnectGatt("band-1".to_string())), 0);
        assert!(!manager.is_connected());
    }
}
