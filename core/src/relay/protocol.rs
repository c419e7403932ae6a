//! Mixnet wire protocol: flagged frames and length-prefixed framing
//!
//! Every connection carries one request frame: `[len: u32 BE][flag: 1][body]`.
//! PULL requests are answered on the same connection with one response frame
//! holding a bincode list of sealed payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted on the wire (flag included)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// bincode length prefix in front of each payload of a `PullResponse`
pub const PULL_ENTRY_OVERHEAD: usize = 8;

/// Budget for the payloads of one `PullResponse`, entry prefixes included.
/// The rest of the frame holds the list length and the `more` marker.
pub const PULL_BATCH_BYTES: usize = MAX_FRAME_SIZE - 16;

/// Frame type marker, the first byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Communication packet (real messages, loop cover, rate-compliant cover)
    Comm,
    /// Drop cover traffic
    Cover,
    /// Mailbox retrieval request
    Pull,
}

impl Flag {
    pub const COMM: u8 = 0xc6;
    pub const COVER: u8 = 0xc7;
    pub const PULL: u8 = 0xff;

    pub fn to_byte(self) -> u8 {
        match self {
            Flag::Comm => Self::COMM,
            Flag::Cover => Self::COVER,
            Flag::Pull => Self::PULL,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::COMM => Some(Flag::Comm),
            Self::COVER => Some(Flag::Cover),
            Self::PULL => Some(Flag::Pull),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,
    #[error("Unknown flag 0x{0:02x}")]
    UnknownFlag(u8),
    #[error("Frame of {0} bytes exceeds maximum of {MAX_FRAME_SIZE}")]
    TooLarge(usize),
    #[error("Invalid pull request")]
    InvalidPull,
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `[flag][body]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggedFrame {
    pub flag: Flag,
    pub body: Vec<u8>,
}

impl FlaggedFrame {
    pub fn new(flag: Flag, body: Vec<u8>) -> Self {
        Self { flag, body }
    }

    pub fn comm(body: Vec<u8>) -> Self {
        Self::new(Flag::Comm, body)
    }

    pub fn cover(body: Vec<u8>) -> Self {
        Self::new(Flag::Cover, body)
    }

    /// Mailbox retrieval request for `recipient_id`
    pub fn pull(recipient_id: &str) -> Self {
        Self::new(Flag::Pull, recipient_id.as_bytes().to_vec())
    }

    /// Recipient id named by a PULL frame
    pub fn pull_recipient(&self) -> Result<&str, FrameError> {
        if self.flag != Flag::Pull || self.body.is_empty() {
            return Err(FrameError::InvalidPull);
        }
        std::str::from_utf8(&self.body).map_err(|_| FrameError::InvalidPull)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.body.len());
        bytes.push(self.flag.to_byte());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&flag, body) = bytes.split_first().ok_or(FrameError::Empty)?;
        let flag = Flag::from_byte(flag).ok_or(FrameError::UnknownFlag(flag))?;
        Ok(Self {
            flag,
            body: body.to_vec(),
        })
    }
}

/// Payloads returned for a PULL request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub payloads: Vec<Vec<u8>>,
    /// More payloads are still queued; pull again
    pub more: bool,
}

impl PullResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serialize(self).map_err(|e| FrameError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(bytes).map_err(|e| FrameError::Serialization(e.to_string()))
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
