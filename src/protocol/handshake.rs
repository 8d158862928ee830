//! Shared-secret authentication against the daemon.
//!
//! The client never sends the secret. It asks the daemon for a 4-byte server
//! nonce, then proves knowledge of the secret with
//! `HMAC-SHA1(key = secret, message = server_nonce || client_nonce)` and sends
//! `client_nonce || digest` back.
//!
//! Client nonces come from a per-connection [`NonceSequence`]: a random seed
//! drawn once, incremented for every attempt so no nonce is reused while the
//! connection object lives.

use crate::error::{constants, ProtocolError, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tracing::{debug, instrument};

/// Size of the server and client nonces
pub const NONCE_SIZE: usize = 4;

/// Size of the HMAC-SHA1 digest
pub const DIGEST_SIZE: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// Per-connection client nonce source.
#[derive(Debug, Default)]
pub struct NonceSequence {
    next: Option<u32>,
}

impl NonceSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a fixed seed instead of a random one.
    pub fn with_seed(seed: u32) -> Self {
        Self { next: Some(seed) }
    }

    /// Nonce for the next attempt, as sent on the wire (little-endian).
    pub fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let nonce = self.next.unwrap_or_else(rand::random::<u32>);
        self.next = Some(nonce.wrapping_add(1));
        nonce.to_le_bytes()
    }
}

/// Secrets are restricted to ASCII.
pub fn validate_secret(secret: &str) -> Result<()> {
    if secret.is_ascii() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidArgument(
            constants::ERR_NON_ASCII_SECRET.to_string(),
        ))
    }
}

/// `HMAC-SHA1(secret, server_nonce || client_nonce)`.
pub fn auth_digest(
    secret: &str,
    server_nonce: &[u8; NONCE_SIZE],
    client_nonce: &[u8; NONCE_SIZE],
) -> Result<[u8; DIGEST_SIZE]> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| ProtocolError::InvalidArgument(format!("unusable secret: {e}")))?;
    mac.update(server_nonce);
    mac.update(client_nonce);

    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

/// Payload of the authenticate call. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AuthenticationRequest {
    client_nonce: [u8; NONCE_SIZE],
    digest: [u8; DIGEST_SIZE],
}

impl AuthenticationRequest {
    /// Validate `secret` and derive the request for one attempt.
    #[instrument(skip(secret, server_nonce, nonces))]
    pub fn build(
        secret: &str,
        server_nonce: &[u8; NONCE_SIZE],
        nonces: &mut NonceSequence,
    ) -> Result<Self> {
        validate_secret(secret)?;
        let client_nonce = nonces.next_nonce();
        let digest = auth_digest(secret, server_nonce, &client_nonce)?;
        debug!("Derived authentication digest");
        Ok(Self {
            client_nonce,
            digest,
        })
    }

    pub fn client_nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.client_nonce
    }

    /// `client_nonce || digest`, 24 bytes.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(NONCE_SIZE + DIGEST_SIZE);
        payload.extend_from_slice(&self.client_nonce);
        payload.extend_from_slice(&self.digest);
        payload
    }
}

/// Check a received authenticate payload against `secret`. This is the
/// daemon-side half of the exchange, used by test doubles.
pub fn verify_authentication(
    secret: &str,
    server_nonce: &[u8; NONCE_SIZE],
    payload: &[u8],
) -> bool {
    if payload.len() != NONCE_SIZE + DIGEST_SIZE {
        return false;
    }
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(server_nonce);
    mac.update(&payload[..NONCE_SIZE]);
    mac.verify_slice(&payload[NONCE_SIZE..]).is_ok()
}
