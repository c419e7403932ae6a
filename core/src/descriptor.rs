// Participant descriptors: the published identity of every mix, provider and client

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a participant plays in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantKind {
    Mix,
    Provider,
    Client,
}

impl ParticipantKind {
    /// Directory namespace for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantKind::Mix => "mix",
            ParticipantKind::Provider => "provider",
            ParticipantKind::Client => "client",
        }
    }
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published descriptor of a network participant.
///
/// Immutable once published. Cached read-only copies are held by path
/// selection and relays; the directory owns the canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantDescriptor {
    /// Unique participant identifier
    pub id: String,
    /// Participant role
    pub kind: ParticipantKind,
    /// Host the participant listens on
    pub host: String,
    /// Port the participant listens on
    pub port: String,
    /// X25519 public key (32 bytes)
    pub public_key: Vec<u8>,
    /// Optional mix layer (informational; paths are not layered)
    pub layer: Option<u32>,
    /// For clients: id of the provider holding their mailbox
    pub provider: Option<String>,
}

impl ParticipantDescriptor {
    pub fn new(
        id: impl Into<String>,
        kind: ParticipantKind,
        host: impl Into<String>,
        port: impl Into<String>,
        public_key: [u8; 32],
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            host: host.into(),
            port: port.into(),
            public_key: public_key.to_vec(),
            layer: None,
            provider: None,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider = Some(provider_id.into());
        self
    }

    /// `host:port` transport address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Public key as a fixed-size array, if well formed
    pub fn public_key_bytes(&self) -> Option<[u8; 32]> {
        <[u8; 32]>::try_from(self.public_key.as_slice()).ok()
    }
}

/// Ordered route of a single packet: intermediate mixes, then the terminal node.
///
/// Built fresh for every packet and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub hops: Vec<ParticipantDescriptor>,
}

impl Path {
    pub fn new(hops: Vec<ParticipantDescriptor>) -> Self {
        Self { hops }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Entry node the packet is transmitted to
    pub fn first(&self) -> Option<&ParticipantDescriptor> {
        self.hops.first()
    }

    /// Terminal node of the route
    pub fn last(&self) -> Option<&ParticipantDescriptor> {
        self.hops.last()
    }
}
