// Transport module: how frames reach other participants

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use thiserror::Error;

use crate::relay::protocol::{FlaggedFrame, FrameError};

pub use memory::{ChannelTransport, SentFrame};
pub use tcp::{TcpTransport, TcpTransportConfig};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Timed out talking to {0}")]
    Timeout(String),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Transport closed")]
    Closed,
}

/// Sends flagged frames to `host:port` addresses.
///
/// Every sender in the crate (client pipeline, cover sources, relay
/// forwarders) goes through this trait.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Deliver one frame, without waiting for any answer
    async fn transmit(&self, address: &str, frame: &FlaggedFrame) -> Result<(), TransportError>;

    /// Deliver one frame and wait for the single response frame
    async fn request(&self, address: &str, frame: &FlaggedFrame) -> Result<Vec<u8>, TransportError>;
}
