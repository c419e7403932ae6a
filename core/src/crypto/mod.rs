// Cryptography module: end-to-end payload sealing

pub mod encrypt;

pub use encrypt::{open, seal, SealError, SEAL_OVERHEAD};
