// End-to-end sealing: X25519 ECDH + XChaCha20-Poly1305
//
// Flow:
// 1. Generate ephemeral X25519 keypair
// 2. ECDH: ephemeral_secret × recipient_public → shared_secret
// 3. KDF: Blake3::derive_key(shared_secret) → symmetric_key
// 4. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 5. Output: ephemeral_pub (32) || nonce (24) || ciphertext
//
// Recipient reverses:
// 1. ECDH: recipient_secret × ephemeral_public → shared_secret
// 2. KDF: same derivation → symmetric_key
// 3. Decrypt: XChaCha20-Poly1305(symmetric_key, nonce, ciphertext)
//
// Providers only ever store sealed bytes, so they cannot tell a loop cover
// payload from a real message.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

/// KDF context string for deriving sealing keys from ECDH shared secrets.
/// Changing this breaks compatibility with all sealed payloads in flight.
const KDF_CONTEXT: &str = "loopmix 2026-01 recipient sealing";

const EPHEMERAL_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Bytes added by `seal` on top of the plaintext
pub const SEAL_OVERHEAD: usize = EPHEMERAL_SIZE + NONCE_SIZE + TAG_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("Sealed payload too short")]
    Truncated,
    #[error("Non-contributory key exchange")]
    WeakKey,
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    Decryption,
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT, shared_secret)
}

/// Seal `plaintext` to the holder of `recipient_public_key`.
///
/// The recipient key is bound as associated data, so a payload re-targeted
/// at another key fails to open.
pub fn seal<R: RngCore + CryptoRng>(
    recipient_public_key: &[u8; 32],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, SealError> {
    let recipient = PublicKey::from(*recipient_public_key);

    let ephemeral_secret = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient);
    if !shared_secret.was_contributory() {
        return Err(SealError::WeakKey);
    }
    let mut symmetric_key = derive_key(shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| SealError::Encryption)?;
    symmetric_key.zeroize();

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: recipient_public_key,
            },
        )
        .map_err(|_| SealError::Encryption)?;

    let mut sealed = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a payload sealed to `recipient_secret`
pub fn open(recipient_secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(SealError::Truncated);
    }

    let mut ephemeral_bytes = [0u8; EPHEMERAL_SIZE];
    ephemeral_bytes.copy_from_slice(&sealed[..EPHEMERAL_SIZE]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);

    let shared_secret = recipient_secret.diffie_hellman(&ephemeral_public);
    if !shared_secret.was_contributory() {
        return Err(SealError::WeakKey);
    }
    let mut symmetric_key = derive_key(shared_secret.as_bytes());

    let nonce = XNonce::from_slice(&sealed[EPHEMERAL_SIZE..EPHEMERAL_SIZE + NONCE_SIZE]);
    let recipient_public = PublicKey::from(recipient_secret);

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| SealError::Decryption)?;
    symmetric_key.zeroize();

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[EPHEMERAL_SIZE + NONCE_SIZE..],
                aad: recipient_public.as_bytes(),
            },
        )
        .map_err(|_| SealError::Decryption)
}
