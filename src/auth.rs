use tracing::{debug, info, warn};

use crate::{
    error::{BuzzerError, Result},
    gatt::{GattIo, ResponseMatch},
    protocol::{
        encrypt_challenge, expect_success, parse_challenge, request_random_command,
        send_encrypted_command, send_key_command, AuthStep, AUTH_NOTIFICATION_DESC_UUID,
        AUTH_SECRET_KEY, AUTH_SEND_ENCRYPTED, AUTH_SEND_KEY,
    },
    types::CharacteristicRef,
};

/// Three round challenge/response handshake unlocking the band
///
/// The band answers every command with a notification on the auth
/// characteristic, so notifications are enabled before the first write.
/// Each step runs only after the previous one succeeded.
pub struct Authenticator {
    io: GattIo,
    key: [u8; 16],
}

impl Authenticator {
    /// Create an authenticator using the band's fixed secret key
    #[must_use]
    pub const fn new(io: GattIo) -> Self {
        Self::with_key(io, AUTH_SECRET_KEY)
    }

    /// Create an authenticator with a different shared key
    #[must_use]
    pub const fn with_key(io: GattIo, key: [u8; 16]) -> Self {
        Self { io, key }
    }

    /// Run the handshake against the auth characteristic of the current session
    ///
    /// # Errors
    ///
    /// Returns [`BuzzerError::SetupFailed`] if notifications cannot be enabled
    /// and [`BuzzerError::UnexpectedResponse`] naming the failing step on any
    /// response mismatch. Transport failures from the I/O layer are passed
    /// through unchanged.
    pub async fn authenticate(&self, characteristic: &CharacteristicRef) -> Result<()> {
        info!("Starting authentication handshake");

        if !self
            .io
            .enable_notifications(characteristic, AUTH_NOTIFICATION_DESC_UUID)
        {
            warn!("Enabling auth notifications failed");
            return Err(BuzzerError::SetupFailed(AuthStep::EnableNotifications));
        }

        self.send_secret_key(characteristic).await?;
        let challenge = self.request_random_number(characteristic).await?;
        self.send_encrypted_number(characteristic, &challenge).await?;

        info!("Authentication handshake complete");
        Ok(())
    }

    async fn send_secret_key(&self, characteristic: &CharacteristicRef) -> Result<()> {
        let response = self
            .io
            .write_with_response(
                characteristic,
                &send_key_command(&self.key),
                ResponseMatch::Notification,
            )
            .await?;
        expect_success(AuthStep::SendSecretKey, AUTH_SEND_KEY, &response)?;
        debug!("Secret key accepted");
        Ok(())
    }

    async fn request_random_number(&self, characteristic: &CharacteristicRef) -> Result<[u8; 16]> {
        let response = self
            .io
            .write_with_response(
                characteristic,
                &request_random_command(),
                ResponseMatch::Notification,
            )
            .await?;
        let challenge = parse_challenge(&response)?;
        debug!("Received challenge");
        Ok(challenge)
    }

    async fn send_encrypted_number(
        &self,
        characteristic: &CharacteristicRef,
        challenge: &[u8; 16],
    ) -> Result<()> {
        let encrypted = encrypt_challenge(&self.key, challenge);
        let response = self
            .io
            .write_with_response(
                characteristic,
                &send_encrypted_command(&encrypted),
                ResponseMatch::Notification,
            )
            .await?;
        expect_success(AuthStep::SendEncryptedNumber, AUTH_SEND_ENCRYPTED, &response)?;
        debug!("Encrypted challenge accepted");
        Ok(())
    }
}
