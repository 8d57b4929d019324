use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{debug, info, warn};

use crate::{
    backend::GattBackend,
    error::{BuzzerError, Result},
    relay::{EventRelay, Subscription},
    types::{DeviceRef, Event, ScanFilter, ScanMode},
};

/// How a scan ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The named device was found
    Found(DeviceRef),
    /// An `Abort` cancelled the scan
    Aborted,
}

/// Drives hardware discovery for one peripheral at a time
///
/// The hardware scan runs only between [`Scanner::scan`] starting it and the
/// single stop issued when that scan ends, whichever way it ends.
pub struct Scanner {
    relay: EventRelay,
    backend: Arc<dyn GattBackend>,
    active: Mutex<Option<u64>>,
    generation: AtomicU64,
}

impl Scanner {
    /// Create a scanner publishing through `relay`
    #[must_use]
    pub fn new(relay: EventRelay, backend: Arc<dyn GattBackend>) -> Self {
        Self {
            relay,
            backend,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Scan until `device_name` is found, the scan fails, or an `Abort` arrives
    ///
    /// Dropping the returned future stops the hardware scan as well.
    ///
    /// # Errors
    ///
    /// Returns [`BuzzerError::ScanFailure`] with the hardware code when the
    /// scanner fails, and [`BuzzerError::ProtocolViolation`] when any other
    /// event shows up while scanning.
    pub async fn scan(&self, device_name: &str) -> Result<ScanOutcome> {
        let mut events = self.relay.subscribe();
        self.scan_from(&mut events, device_name).await
    }

    /// Scan using a subscription taken earlier by the caller
    ///
    /// Events published after `events` was taken are observed even if they
    /// arrived before this call. The subscription stays usable afterwards.
    pub(crate) async fn scan_from(
        &self,
        events: &mut Subscription,
        device_name: &str,
    ) -> Result<ScanOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Scanning for {}", device_name);
        self.backend.start_scan(&ScanFilter {
            device_name: device_name.to_string(),
            mode: ScanMode::LowLatency,
        })?;

        *self.lock_active() = Some(generation);
        let guard = ScanGuard {
            scanner: self,
            generation,
        };

        let outcome = loop {
            let Some(event) = events.recv().await else {
                break Ok(ScanOutcome::Aborted);
            };
            match event {
                Event::Abort => {
                    debug!("Scan aborted");
                    break Ok(ScanOutcome::Aborted);
                }
                Event::ScanFound(device) => {
                    info!("Found {} ({})", device_name, device.id);
                    break Ok(ScanOutcome::Found(device));
                }
                Event::ScanFailed(code) => {
                    warn!("Scan failed with code {}", code);
                    break Err(BuzzerError::ScanFailure(code));
                }
                other => {
                    warn!("Unexpected event while scanning: {}", other);
                    break Err(BuzzerError::ProtocolViolation(other.to_string()));
                }
            }
        };

        drop(guard);
        outcome
    }

    /// Stop whichever scan is running, if any
    pub fn stop(&self) {
        let active = self.lock_active().take();
        if let Some(generation) = active {
            debug!("Stopping scan #{}", generation);
            self.backend.stop_scan();
        }
    }

    /// Whether a scan is currently running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock_active().is_some()
    }

    fn stop_generation(&self, generation: u64) {
        let mut active = self.lock_active();
        if *active == Some(generation) {
            *active = None;
            drop(active);
            debug!("Stopping scan #{}", generation);
            self.backend.stop_scan();
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ScanGuard<'a> {
    scanner: &'a Scanner,
    generation: u64,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.scanner.stop_generation(self.generation);
    }
}
