use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::types::DetectionPolicy;

/// One frame reported by the pitch detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchSample {
    /// Frame start, in seconds since the detector started
    pub start_secs: f32,
    /// Frame end, in seconds since the detector started
    pub end_secs: f32,
    /// Estimated pitch in Hz, meaningless unless `is_pitched`
    pub pitch_hz: f32,
    /// Root mean square amplitude of the frame
    pub amplitude: f32,
    /// Whether the detector found a pitch in this frame
    pub is_pitched: bool,
}

impl PitchSample {
    /// A pitched frame
    #[must_use]
    pub const fn pitched(start_secs: f32, end_secs: f32, pitch_hz: f32) -> Self {
        Self {
            start_secs,
            end_secs,
            pitch_hz,
            amplitude: 0.0,
            is_pitched: true,
        }
    }

    /// A frame without a recognizable pitch
    #[must_use]
    pub const fn unpitched(start_secs: f32, end_secs: f32) -> Self {
        Self {
            start_secs,
            end_secs,
            pitch_hz: 0.0,
            amplitude: 0.0,
            is_pitched: false,
        }
    }
}

/// Decides which detector frames are alerts
///
/// Pitched frames are kept for a short window. A frame is an alert when it
/// is pitched, the window's average and peak pitch exceed the policy's
/// thresholds, and enough time has passed since the previous alert.
#[derive(Debug, Clone)]
pub struct PitchFilter {
    policy: DetectionPolicy,
    window: VecDeque<(f32, f32)>,
    last_detection_secs: f32,
}

impl PitchFilter {
    /// Create a filter applying `policy`
    #[must_use]
    pub const fn new(policy: DetectionPolicy) -> Self {
        Self {
            policy,
            window: VecDeque::new(),
            last_detection_secs: 0.0,
        }
    }

    /// The thresholds in use
    #[must_use]
    pub const fn policy(&self) -> &DetectionPolicy {
        &self.policy
    }

    /// Feed one frame, returning whether it is an alert
    pub fn observe(&mut self, sample: &PitchSample) -> bool {
        if sample.is_pitched {
            self.window.push_back((sample.start_secs, sample.pitch_hz));
        }
        let horizon = sample.end_secs - self.policy.window_secs;
        while self.window.front().is_some_and(|(start, _)| *start < horizon) {
            self.window.pop_front();
        }

        if !sample.is_pitched || self.window.is_empty() {
            return false;
        }

        #[allow(clippy::cast_precision_loss)]
        let average = self.window.iter().map(|(_, pitch)| pitch).sum::<f32>() / self.window.len() as f32;
        let peak = self
            .window
            .iter()
            .map(|(_, pitch)| *pitch)
            .fold(f32::MIN, f32::max);

        let detected = average > self.policy.min_pitch_average_hz
            && peak > self.policy.min_pitch_peak_hz
            && sample.end_secs - self.last_detection_secs > self.policy.min_interval_secs;
        if detected {
            debug!(
                "Alert at {:.2}s (average {:.0} Hz, peak {:.0} Hz)",
                sample.end_secs, average, peak
            );
            self.last_detection_secs = sample.end_secs;
        }
        detected
    }

    /// Forget every frame and the last alert time
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_detection_secs = 0.0;
    }
}

impl Default for PitchFilter {
    fn default() -> Self {
        Self::new(DetectionPolicy::default())
    }
}
