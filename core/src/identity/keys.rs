// Cryptographic key management

use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::descriptor::{ParticipantDescriptor, ParticipantKind};

/// Long-term X25519 key pair of a network participant.
///
/// Relays use the secret to peel their packet layer; clients use it to open
/// payloads sealed to them.
#[derive(Clone)]
pub struct NodeKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeKeys {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::generate_with_rng(&mut rand::rngs::OsRng)
    }

    /// Generate a key pair from a caller-owned generator
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_bytes);
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Serialize the secret key.
    /// Returns a `Zeroizing<Vec<u8>>` that wipes the key material on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Restore a key pair from secret key bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut secret_bytes = <[u8; 32]>::try_from(bytes).ok()?;
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = PublicKey::from(&secret);
        Some(Self { secret, public })
    }

    /// Build the descriptor to publish for this key pair
    pub fn descriptor(
        &self,
        id: impl Into<String>,
        kind: ParticipantKind,
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> ParticipantDescriptor {
        ParticipantDescriptor::new(id, kind, host, port, self.public_key())
    }
}
