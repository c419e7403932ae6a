// Loopmix: Loopix-style mix network core
//
// Clients wrap every message in a fixed-size Sphinx packet, send it through a
// random path of mixes that each hold it for an exponential delay, and hide
// their real sending pattern behind loop, drop and rate-compliant cover.

pub mod bench;
pub mod client;
pub mod crypto;
pub mod descriptor;
pub mod identity;
pub mod privacy;
pub mod registration;
pub mod relay;
pub mod store;
pub mod topology;
pub mod transport;

use thiserror::Error;

pub use bench::{BenchClient, BenchConfig, BenchError, BenchSummary};
pub use client::{ClientConfig, ClientError, ClientPipeline, ClientStats, ReceivedMessage};
pub use descriptor::{ParticipantDescriptor, ParticipantKind, Path};
pub use identity::NodeKeys;
pub use privacy::{CoverKind, CoverTrafficPolicy, DelaySampler, PathSelector, PeelResult, SphinxPacket};
pub use registration::RegistrationClient;
pub use relay::{Mailbox, MailboxConfig, RelayConfig, RelayEngine, Role};
pub use store::{Directory, MemoryStorage, SledStorage, StorageDirectory};
pub use topology::{Topology, TopologyHandle};
pub use transport::{PacketTransport, TcpTransport, TcpTransportConfig};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Crate-wide error taxonomy.
///
/// Only `Configuration` and send-path `Transport` errors ever reach an end
/// user; integrity failures and protocol violations are dropped where they
/// are detected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MixnetError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Integrity check failed")]
    Integrity,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl MixnetError {
    /// Errors that stop a participant from starting
    pub fn is_fatal(&self) -> bool {
        matches!(self, MixnetError::Configuration(_))
    }
}

impl From<privacy::SphinxError> for MixnetError {
    fn from(err: privacy::SphinxError) -> Self {
        use privacy::SphinxError;
        match err {
            SphinxError::Integrity => MixnetError::Integrity,
            SphinxError::Malformed | SphinxError::InvalidRouting | SphinxError::InvalidPublicKey => {
                MixnetError::ProtocolViolation(err.to_string())
            }
            other => MixnetError::Encoding(other.to_string()),
        }
    }
}

impl From<privacy::PathError> for MixnetError {
    fn from(err: privacy::PathError) -> Self {
        MixnetError::Configuration(err.to_string())
    }
}

impl From<privacy::DelayError> for MixnetError {
    fn from(err: privacy::DelayError) -> Self {
        MixnetError::Configuration(err.to_string())
    }
}

impl From<privacy::CoverError> for MixnetError {
    fn from(err: privacy::CoverError) -> Self {
        MixnetError::Configuration(err.to_string())
    }
}

impl From<relay::MailboxError> for MixnetError {
    fn from(err: relay::MailboxError) -> Self {
        match err {
            relay::MailboxError::InvalidConfig(_) => MixnetError::Configuration(err.to_string()),
            relay::MailboxError::Full(_) => MixnetError::ProtocolViolation(err.to_string()),
        }
    }
}

impl From<relay::FrameError> for MixnetError {
    fn from(err: relay::FrameError) -> Self {
        match err {
            relay::FrameError::Io(_) => MixnetError::Transport(err.to_string()),
            other => MixnetError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<relay::RelayError> for MixnetError {
    fn from(err: relay::RelayError) -> Self {
        MixnetError::Configuration(err.to_string())
    }
}

impl From<transport::TransportError> for MixnetError {
    fn from(err: transport::TransportError) -> Self {
        MixnetError::Transport(err.to_string())
    }
}

impl From<store::DirectoryError> for MixnetError {
    fn from(err: store::DirectoryError) -> Self {
        MixnetError::Configuration(err.to_string())
    }
}

impl From<crypto::SealError> for MixnetError {
    fn from(err: crypto::SealError) -> Self {
        match err {
            crypto::SealError::Decryption => MixnetError::Integrity,
            other => MixnetError::Encoding(other.to_string()),
        }
    }
}

impl From<ClientError> for MixnetError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::InvalidConfig(_)
            | ClientError::UnknownRecipient(_)
            | ClientError::UnknownProvider(_)
            | ClientError::Shutdown => MixnetError::Configuration(err.to_string()),
            ClientError::Path(e) => e.into(),
            ClientError::Delay(e) => e.into(),
            ClientError::Encoding(e) => e.into(),
            ClientError::Seal(e) => e.into(),
            ClientError::Transport(e) => e.into(),
            ClientError::Frame(e) => e.into(),
            ClientError::Relay(e) => e.into(),
            ClientError::MessageTooLarge(_) | ClientError::Payload(_) => MixnetError::Encoding(err.to_string()),
        }
    }
}

impl From<BenchError> for MixnetError {
    fn from(err: BenchError) -> Self {
        match err {
            BenchError::InvalidConfig(_) => MixnetError::Configuration(err.to_string()),
            BenchError::Send { source, .. } | BenchError::Client(source) => source.into(),
            BenchError::Io(e) => MixnetError::Transport(e.to_string()),
        }
    }
}
