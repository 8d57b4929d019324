use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::{uuid, Uuid};

use crate::error::{BuzzerError, Result};

/// Advertised name of the supported wrist band
pub const DEVICE_NAME: &str = "MI Band 2";

/// Service hosting the authentication characteristic
pub const AUTH_SERVICE_UUID: Uuid = uuid!("0000fee1-0000-1000-8000-00805f9b34fb");

/// Characteristic used for the challenge/response handshake
pub const AUTH_CHAR_UUID: Uuid = uuid!("00000009-0000-3512-2118-0009af100700");

/// Client characteristic configuration descriptor of the auth characteristic
pub const AUTH_NOTIFICATION_DESC_UUID: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// Immediate alert service
pub const ALERT_SERVICE_UUID: Uuid = uuid!("00001802-0000-1000-8000-00805f9b34fb");

/// Alert level characteristic, written without response
pub const ALERT_CHAR_UUID: Uuid = uuid!("00002a06-0000-1000-8000-00805f9b34fb");

/// Value written to a CCCD to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Handshake command: send the shared secret key
pub const AUTH_SEND_KEY: u8 = 0x01;
/// Handshake command: request a random challenge
pub const AUTH_REQUEST_RANDOM: u8 = 0x02;
/// Handshake command: send the encrypted challenge
pub const AUTH_SEND_ENCRYPTED: u8 = 0x03;
/// First byte of every handshake response
pub const AUTH_RESPONSE: u8 = 0x10;
/// Status byte of a successful handshake response
pub const AUTH_SUCCESS: u8 = 0x01;
/// Status byte of a failed handshake response
pub const AUTH_FAIL: u8 = 0x04;
/// Tag byte following every handshake command
pub const AUTH_DEVICE_TAG: u8 = 0x08;

/// Shared secret key of the handshake
pub const AUTH_SECRET_KEY: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x40, 0x41, 0x42, 0x43, 0x44, 0x45,
];

/// Length of the random challenge sent by the band
pub const CHALLENGE_SIZE: usize = 16;

/// Full length of the random challenge response
pub const CHALLENGE_RESPONSE_SIZE: usize = 3 + CHALLENGE_SIZE;

/// Vibrate without showing a status icon (1 = message icon, 2 = phone icon)
pub const VIBRATE_ON: [u8; 1] = [0x03];

/// Stop vibrating
pub const VIBRATE_OFF: [u8; 1] = [0x00];

/// Steps of the authentication handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStep {
    /// Enabling notifications on the auth characteristic
    EnableNotifications,
    /// Sending the shared secret key
    SendSecretKey,
    /// Requesting the random challenge
    RequestRandomNumber,
    /// Sending the encrypted challenge
    SendEncryptedNumber,
}

impl AuthStep {
    /// Name used when reporting a failure of this step
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EnableNotifications => "enableNotifications",
            Self::SendSecretKey => "sendSecretKey",
            Self::RequestRandomNumber => "requestRandomNumber",
            Self::SendEncryptedNumber => "sendEncryptedNumber",
        }
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build `[SEND_KEY, tag] + key`
#[must_use]
pub fn send_key_command(key: &[u8; 16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + key.len());
    buf.put_u8(AUTH_SEND_KEY);
    buf.put_u8(AUTH_DEVICE_TAG);
    buf.put_slice(key);
    buf.freeze()
}

/// Build `[REQUEST_RANDOM, tag]`
#[must_use]
pub fn request_random_command() -> Bytes {
    Bytes::from_static(&[AUTH_REQUEST_RANDOM, AUTH_DEVICE_TAG])
}

/// Build `[SEND_ENCRYPTED, tag] + ciphertext`
#[must_use]
pub fn send_encrypted_command(ciphertext: &[u8; CHALLENGE_SIZE]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + CHALLENGE_SIZE);
    buf.put_u8(AUTH_SEND_ENCRYPTED);
    buf.put_u8(AUTH_DEVICE_TAG);
    buf.put_slice(ciphertext);
    buf.freeze()
}

/// The exact success response the band sends for `command`
#[must_use]
pub const fn success_response(command: u8) -> [u8; 3] {
    [AUTH_RESPONSE, command, AUTH_SUCCESS]
}

/// Require `response` to be exactly the success response of `command`
///
/// # Errors
///
/// Returns [`BuzzerError::UnexpectedResponse`] naming `step` on any mismatch.
pub fn expect_success(step: AuthStep, command: u8, response: &[u8]) -> Result<()> {
    if response == success_response(command) {
        Ok(())
    } else {
        Err(BuzzerError::UnexpectedResponse(step))
    }
}

/// Extract the 16 byte challenge from a random number response
///
/// # Errors
///
/// Returns [`BuzzerError::UnexpectedResponse`] for
/// [`AuthStep::RequestRandomNumber`] unless the response is exactly 19 bytes
/// starting with the success header.
pub fn parse_challenge(response: &[u8]) -> Result<[u8; CHALLENGE_SIZE]> {
    if response.len() != CHALLENGE_RESPONSE_SIZE
        || response[..3] != success_response(AUTH_REQUEST_RANDOM)
    {
        return Err(BuzzerError::UnexpectedResponse(AuthStep::RequestRandomNumber));
    }

    let mut challenge = [0u8; CHALLENGE_SIZE];
    challenge.copy_from_slice(&response[3..]);
    Ok(challenge)
}

/// Encrypt one challenge block with AES-128 in ECB mode without padding
#[must_use]
pub fn encrypt_challenge(key: &[u8; 16], challenge: &[u8; CHALLENGE_SIZE]) -> [u8; CHALLENGE_SIZE] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(challenge);
    cipher.encrypt_block(&mut block);

    let mut encrypted = [0u8; CHALLENGE_SIZE];
    encrypted.copy_from_slice(&block);
    encrypted
}
