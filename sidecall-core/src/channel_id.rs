//! Channel identifier derivation from the shared pairing secret.

use sha2::{Digest, Sha256};

/// Fixed prefix mixed into the digest so SideCall channels never collide
/// with another application's hashed identifiers.
const SERVICE_ID_PREFIX: &str = "io.sidecall.relay.";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelIdError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("pin must not be empty")]
    EmptyPin,
}

/// Derive the opaque channel identifier both devices advertise and discover
/// under: SHA-256 over prefix + username + PIN, first 16 digest bytes as
/// lowercase hex. Deterministic, so two devices holding the same credentials
/// meet on the same channel. The manager treats the result as an opaque
/// token; it is not itself a secret.
pub fn derive_channel_id(username: &str, pin: &str) -> Result<String, ChannelIdError> {
    if username.is_empty() {
        return Err(ChannelIdError::EmptyUsername);
    }
    if pin.is_empty() {
        return Err(ChannelIdError::EmptyPin);
    }
    let mut hasher = Sha256::new();
    hasher.update(SERVICE_ID_PREFIX.as_bytes());
    hasher.update(username.as_bytes());
    hasher.update(pin.as_bytes());
    let digest = hasher.finalize();
    Ok(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
}
