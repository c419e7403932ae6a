//! Relays: mixes, providers and listening clients

pub mod engine;
pub mod mailbox;
pub mod protocol;

pub use engine::{RelayConfig, RelayEngine, RelayError, RelayStatsSnapshot, Role};
pub use mailbox::{Mailbox, MailboxConfig, MailboxEntry, MailboxError, MailboxStats};
pub use protocol::{Flag, FlaggedFrame, FrameError, PullResponse, MAX_FRAME_SIZE, PULL_BATCH_BYTES};
