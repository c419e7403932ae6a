// Node identity: long-term X25519 key material for mixes, providers and clients

mod keys;

pub use keys::NodeKeys;
