// Payload Padding: every packet payload has the same length
//
// Padding format: [original_data][0x80][0x00...0x00]
// The 0x80 marker indicates start of padding.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaddingError {
    #[error("Message too large for fixed padding: {0}")]
    MessageTooLarge(usize),
    #[error("Invalid padding format")]
    InvalidPaddingFormat,
}

/// Pad `message` to exactly `target_size` bytes.
///
/// At least one byte is always consumed by the marker, so the largest message
/// that fits is `target_size - 1` bytes.
pub fn pad_message(message: &[u8], target_size: usize) -> Result<Vec<u8>, PaddingError> {
    if message.len() >= target_size {
        return Err(PaddingError::MessageTooLarge(target_size));
    }

    let mut padded = Vec::with_capacity(target_size);
    padded.extend_from_slice(message);
    padded.push(0x80);
    padded.resize(target_size, 0x00);

    Ok(padded)
}

/// Remove padding from a message
///
/// Finds the last 0x80 marker; everything after it must be zero.
pub fn unpad_message(padded_message: &[u8]) -> Result<Vec<u8>, PaddingError> {
    let marker_pos = padded_message
        .iter()
        .rposition(|&b| b != 0x00)
        .ok_or(PaddingError::InvalidPaddingFormat)?;

    if padded_message[marker_pos] != 0x80 {
        return Err(PaddingError::InvalidPaddingFormat);
    }

    Ok(padded_message[..marker_pos].to_vec())
}
