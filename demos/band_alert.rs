use bandalert::{
    BandBuzzer, Buzzer, BuzzerConfig, BuzzerEvent, DetectionPolicy, Listener, PitchSample,
    Result, SoundAlert,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing::{error, info, warn};

/// Detector frame length at 22050 Hz with 1024 sample buffers
const FRAME_SECS: f32 = 1024.0 / 22_050.0;

/// A few seconds of background noise with two whistles in it
fn whistle_frames() -> Vec<PitchSample> {
    (0..120u16)
        .map(|i| {
            let start = f32::from(i) * FRAME_SECS;
            let end = start + FRAME_SECS;
            match i {
                30..=40 => PitchSample::pitched(start, end, 2_400.0 + f32::from(i - 30) * 40.0),
                80..=90 => PitchSample::pitched(start, end, 2_800.0),
                _ if i % 7 == 0 => PitchSample::pitched(start, end, 220.0),
                _ => PitchSample::unpitched(start, end),
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = BuzzerConfig::default();
    info!("⌚ Looking for {}...", config.device_name);

    let band = Arc::new(BandBuzzer::new(config.clone()).await?);

    let (tx, mut events) = mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |event: BuzzerEvent| {
        let _ = tx.send(event);
    });

    let mut alert = SoundAlert::new(band.clone(), DetectionPolicy::default(), config.buzz_duration_ms);
    alert.open(Some(listener));

    match timeout(Duration::from_secs(30), events.recv()).await {
        Ok(Some(BuzzerEvent::Ready)) => info!("✅ {} ready", band.name()),
        Ok(Some(BuzzerEvent::Error(e))) => {
            error!("❌ Opening the band failed: {}", e);
            return Err(e);
        }
        Ok(other) => warn!("⚠️ Unexpected buzzer event: {:?}", other),
        Err(_) => warn!("⚠️ Band not found yet, alerts will be skipped"),
    }

    info!("🎵 Replaying detector frames...");
    for frame in whistle_frames() {
        if alert.observe(&frame) {
            info!("📳 Alert at {:.2}s", frame.end_secs);
        }
        tokio::time::sleep(Duration::from_secs_f32(FRAME_SECS)).await;
    }

    // let the last vibration finish
    tokio::time::sleep(Duration::from_millis(config.buzz_duration_ms)).await;

    alert.close();
    if let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
        info!("👋 {:?}", event);
    }

    Ok(())
}
