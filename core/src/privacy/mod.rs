// Privacy core: packet format, path selection, mixing delays and cover policy

pub mod circuit;
pub mod cover;
pub mod padding;
pub mod sphinx;
pub mod timing;

pub use circuit::{PathError, PathSelector};
pub use cover::{CoverError, CoverKind, CoverTrafficPolicy};
pub use padding::{pad_message, unpad_message, PaddingError};
pub use sphinx::{PeelResult, SphinxError, SphinxPacket, Terminal, MAX_HOPS, MAX_MESSAGE_SIZE, PACKET_SIZE};
pub use timing::{DelayError, DelaySampler, DelayVector};
