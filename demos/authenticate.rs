use bandalert::{BandBuzzer, BuzzerConfig, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = BuzzerConfig::default();
    info!("🔐 Pairing with {}", config.device_name);

    let band = BandBuzzer::new(config).await?;
    match band.authenticate_and_wait().await {
        Ok(()) => info!("✅ Band authenticated, alerts will now be accepted"),
        Err(e) => {
            if let Some(step) = e.auth_step() {
                error!("❌ Handshake rejected at {}", step);
            }
            error!("❌ Authentication failed: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
