//! End-to-end payloads carried inside Sphinx packets
//!
//! Everything a client sends to a client is sealed to the recipient's key, so
//! the provider holding it cannot tell a loop from a message. Plaintexts are
//! padded before sealing so every sealed payload fills the packet exactly.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use super::ClientError;
use crate::crypto::{open, seal, SEAL_OVERHEAD};
use crate::privacy::padding::{pad_message, unpad_message};
use crate::privacy::sphinx::MAX_MESSAGE_SIZE;

/// Padded plaintext size; sealed payloads are exactly `MAX_MESSAGE_SIZE` bytes
pub const PADDED_PLAINTEXT_SIZE: usize = MAX_MESSAGE_SIZE - SEAL_OVERHEAD;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientPayload {
    /// Application message
    Message { sender: String, body: Vec<u8> },
    /// Loop cover sent by the recipient to itself
    LoopCover { nonce: u64 },
}

impl ClientPayload {
    pub fn seal<R: RngCore + CryptoRng>(
        &self,
        recipient_public_key: &[u8; 32],
        rng: &mut R,
    ) -> Result<Vec<u8>, ClientError> {
        let encoded = bincode::serialize(self).map_err(|e| ClientError::Payload(e.to_string()))?;
        let plaintext =
            pad_message(&encoded, PADDED_PLAINTEXT_SIZE).map_err(|_| ClientError::MessageTooLarge(encoded.len()))?;
        Ok(seal(recipient_public_key, &plaintext, rng)?)
    }

    pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Self, ClientError> {
        let plaintext = open(secret, sealed)?;
        let encoded = unpad_message(&plaintext).map_err(|e| ClientError::Payload(e.to_string()))?;
        bincode::deserialize(&encoded).map_err(|e| ClientError::Payload(e.to_string()))
    }
}

/// A message surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: String,
    pub body: Vec<u8>,
}
