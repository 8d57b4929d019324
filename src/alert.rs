use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    buzzer::{Buzzer, Listener},
    detection::{PitchFilter, PitchSample},
    types::DetectionPolicy,
};

/// Turns detector frames into vibrations
///
/// Every alert buzzes the remote buzzer and, if present, the local one. A
/// buzzer that is not ready is skipped.
pub struct SoundAlert {
    filter: PitchFilter,
    remote: Arc<dyn Buzzer>,
    local: Option<Arc<dyn Buzzer>>,
    buzz_duration_ms: u64,
}

impl SoundAlert {
    /// Alert through `remote` using `policy`
    #[must_use]
    pub fn new(remote: Arc<dyn Buzzer>, policy: DetectionPolicy, buzz_duration_ms: u64) -> Self {
        Self {
            filter: PitchFilter::new(policy),
            remote,
            local: None,
            buzz_duration_ms,
        }
    }

    /// Also buzz `local` on every alert
    #[must_use]
    pub fn with_local(mut self, local: Arc<dyn Buzzer>) -> Self {
        self.local = Some(local);
        self
    }

    fn buzzers(&self) -> impl Iterator<Item = &Arc<dyn Buzzer>> {
        std::iter::once(&self.remote).chain(self.local.as_ref())
    }

    /// Open every buzzer, reporting their lifecycle to `listener`
    pub fn open(&mut self, listener: Option<Listener>) {
        self.filter.reset();
        for buzzer in self.buzzers() {
            info!("Opening {}", buzzer.name());
            buzzer.open(listener.clone());
        }
    }

    /// Close every buzzer and forget past frames
    pub fn close(&mut self) {
        for buzzer in self.buzzers() {
            buzzer.close();
        }
        self.filter.reset();
    }

    /// Feed one frame, buzzing on an alert
    ///
    /// Returns whether the frame was an alert.
    pub fn observe(&mut self, sample: &PitchSample) -> bool {
        if !self.filter.observe(sample) {
            return false;
        }
        for buzzer in self.buzzers() {
            if buzzer.ready() {
                debug!("Buzzing {} for {}ms", buzzer.name(), self.buzz_duration_ms);
                buzzer.buzz(self.buzz_duration_ms);
            }
        }
        true
    }

    /// Consume frames until the stream ends, returning the number of alerts
    pub async fn run(&mut self, samples: impl Stream<Item = PitchSample>) -> usize {
        let mut samples = std::pin::pin!(samples);
        let mut alerts = 0;
        while let Some(sample) = samples.next().await {
            if self.observe(&sample) {
                alerts += 1;
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BuzzerEvent;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Default)]
    struct RecordingBuzzer {
        ready: AtomicBool,
        opened: AtomicUsize,
        closed: AtomicUsize,
        buzzes: Mutex<Vec<u64>>,
    }

    impl RecordingBuzzer {
        fn ready() -> Arc<Self> {
            let buzzer = Self::default();
            buzzer.ready.store(true, Ordering::SeqCst);
            Arc::new(buzzer)
        }

        fn buzzes(&self) -> Vec<u64> {
            self.buzzes.lock().unwrap().clone()
        }
    }

    impl Buzzer for RecordingBuzzer {
        fn name(&self) -> &str {
            "recorder"
        }

        fn ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn open(&self, listener: Option<Listener>) {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if let Some(listener) = listener {
                listener(BuzzerEvent::Ready);
            }
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn buzz(&self, duration_ms: u64) {
            self.buzzes.lock().unwrap().push(duration_ms);
        }

        fn mute(&self) {}
    }

    #[test]
    fn test_alert_buzzes_ready_buzzers() {
        let remote = RecordingBuzzer::ready();
        let local = Arc::new(RecordingBuzzer::default());
        let mut alert = SoundAlert::new(remote.clone(), DetectionPolicy::default(), 1_000)
            .with_local(local.clone());

        assert!(alert.observe(&PitchSample::pitched(2.0, 2.05, 2_600.0)));
        assert_eq!(remote.buzzes(), vec![1_000]);
        assert!(local.buzzes().is_empty());

        local.ready.store(true, Ordering::SeqCst);
        assert!(alert.observe(&PitchSample::pitched(3.5, 3.55, 2_600.0)));
        assert_eq!(remote.buzzes(), vec![1_000, 1_000]);
        assert_eq!(local.buzzes(), vec![1_000]);
    }

    #[test]
    fn test_quiet_frames_do_not_buzz() {
        let remote = RecordingBuzzer::ready();
        let mut alert = SoundAlert::new(remote.clone(), DetectionPolicy::default(), 500);

        assert!(!alert.observe(&PitchSample::pitched(2.0, 2.05, 300.0)));
        assert!(!alert.observe(&PitchSample::unpitched(2.05, 2.10)));
        assert!(remote.buzzes().is_empty());
    }

    #[test]
    fn test_open_and_close_reach_every_buzzer() {
        let remote = RecordingBuzzer::ready();
        let local = RecordingBuzzer::ready();
        let mut alert = SoundAlert::new(remote.clone(), DetectionPolicy::default(), 1_000)
            .with_local(local.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let listener: Listener = Arc::new({
            let seen = seen.clone();
            move |event: BuzzerEvent| {
                if matches!(event, BuzzerEvent::Ready) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        alert.open(Some(listener));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        alert.close();
        assert_eq!(remote.closed.load(Ordering::SeqCst), 1);
        assert_eq!(local.closed.load(Ordering::SeqCst), 1);
        assert_eq!(remote.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_counts_alerts() {
        let remote = RecordingBuzzer::ready();
        let mut alert = SoundAlert::new(remote.clone(), DetectionPolicy::default(), 1_000);

        let frames = futures::stream::iter(vec![
            PitchSample::pitched(1.50, 1.55, 2_500.0),
            PitchSample::pitched(1.55, 1.60, 2_500.0),
            PitchSample::unpitched(2.00, 2.05),
            PitchSample::pitched(2.80, 2.85, 2_500.0),
        ]);
        assert_eq!(alert.run(frames).await, 2);
        assert_eq!(remote.buzzes().len(), 2);
    }
}
