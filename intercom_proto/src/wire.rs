//! Byte-level encodings of audio messages.
//!
//! Two forms are understood:
//!
//! - **Legacy**: exactly 4 bytes, the level as a little-endian IEEE-754 `f32`. Nothing
//!   else goes on the wire. Receivers must number these messages themselves, in
//!   arrival order.
//! - **V1**: a 4-byte tag ([`FRAME_TAG`]), followed by a [`postcard`]-encoded
//!   [`Frame`]. Audio frames carry an explicit sequence number, which lets receivers
//!   tell network reordering apart from loss.
//!
//! A V1 message is always longer than 4 bytes, so the length alone tells the two
//! forms apart.

use serde::{Deserialize, Serialize};

use crate::Level;

/// Leading bytes of every V1 message.
pub const FRAME_TAG: [u8; 4] = *b"ICv1";

/// Size of a legacy message.
pub const LEGACY_LEN: usize = size_of::<Level>();

/// Upper bound on the size of an encoded message, in any form.
pub const MAX_MESSAGE_LEN: usize =
    // tag
    FRAME_TAG.len()
        // variant discriminant (varint)
        + 1
        // sequence number (varint, at most 10 bytes for a u64)
        + 10
        // level (little endian)
        + size_of::<Level>();

/// A fixed-capacity, stack-allocated encoded message.
pub type EncodedMessage = arrayvec::ArrayVec<u8, MAX_MESSAGE_LEN>;

/// Which encoding to use when sending.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireVersion {
    /// Bare level, no sequence number.
    Legacy,
    /// Tagged frame with an explicit sequence number.
    #[default]
    V1,
}

/// Messages of the V1 form.
///
/// Flat, so that each message carries a single discriminant byte.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Audio { sequence: u64, level: Level },
}

/// Errors raised while encoding or decoding messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("message too short ({0} bytes)")]
    Truncated(usize),
    #[error("unknown message tag")]
    UnknownTag,
    #[error("malformed frame")]
    Malformed,
    #[error("level is not a finite number")]
    NonFinite,
    #[error("message does not fit in {} bytes", MAX_MESSAGE_LEN)]
    BufferFull,
}

/// The information recovered from a received message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    pub level: Level,
    /// `None` for legacy messages.
    pub sequence: Option<u64>,
}

/// Encodes a level reading using the given wire `version`.
///
/// `sequence` is ignored by [`WireVersion::Legacy`].
pub fn encode_sample(
    level: Level,
    sequence: u64,
    version: WireVersion,
) -> Result<EncodedMessage, WireError> {
    let mut message = EncodedMessage::new_const();

    match version {
        WireVersion::Legacy => {
            message
                .try_extend_from_slice(&level.to_le_bytes())
                .map_err(|_| WireError::BufferFull)?;
        }
        WireVersion::V1 => {
            let mut frame_buf = [0u8; MAX_MESSAGE_LEN - FRAME_TAG.len()];

            let frame = postcard::to_slice(&Frame::Audio { sequence, level }, &mut frame_buf)
                .map_err(|_| WireError::BufferFull)?;

            message
                .try_extend_from_slice(&FRAME_TAG)
                .and_then(|()| message.try_extend_from_slice(frame))
                .map_err(|_| WireError::BufferFull)?;
        }
    }

    Ok(message)
}

/// Decodes a received message.
///
/// Every input is bounds-checked: short, foreign or corrupt messages produce an error,
/// never a panic.
pub fn decode_sample(bytes: &[u8]) -> Result<DecodedSample, WireError> {
    let decoded = match bytes.len() {
        0 => return Err(WireError::Empty),
        LEGACY_LEN => {
            let (&level, _rem) = bytes
                .split_first_chunk()
                .ok_or(WireError::Truncated(bytes.len()))?;

            DecodedSample {
                level: Level::from_le_bytes(level),
                sequence: None,
            }
        }
        n if n < LEGACY_LEN => return Err(WireError::Truncated(n)),
        _ => {
            let (tag, payload) = bytes
                .split_first_chunk::<{ FRAME_TAG.len() }>()
                .ok_or(WireError::Truncated(bytes.len()))?;

            if *tag != FRAME_TAG {
                return Err(WireError::UnknownTag);
            }

            match postcard::from_bytes::<Frame>(payload).map_err(|_| WireError::Malformed)? {
                Frame::Audio { sequence, level } => DecodedSample {
                    level,
                    sequence: Some(sequence),
                },
            }
        }
    };

    if decoded.level.is_finite() {
        Ok(decoded)
    } else {
        Err(WireError::NonFinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_is_four_little_endian_bytes() {
        let message = encode_sample(0.5, 99, WireVersion::Legacy).unwrap();

        assert_eq!(message.as_slice(), &0.5f32.to_le_bytes());

        let decoded = decode_sample(&message).unwrap();
        assert_eq!(decoded.level, 0.5);
        assert_eq!(decoded.sequence, None);
    }

    #[test]
    fn v1_carries_the_sequence_number() {
        let message = encode_sample(-0.25, u64::MAX, WireVersion::V1).unwrap();

        assert!(message.starts_with(&FRAME_TAG));
        assert!(message.len() > LEGACY_LEN);

        let decoded = decode_sample(&message).unwrap();
        assert_eq!(decoded.level, -0.25);
        assert_eq!(decoded.sequence, Some(u64::MAX));
    }

    #[test]
    fn short_messages_are_rejected() {
        assert_eq!(decode_sample(&[]), Err(WireError::Empty));
        assert_eq!(decode_sample(&[1, 2, 3]), Err(WireError::Truncated(3)));
    }

    #[test]
    fn foreign_and_corrupt_messages_are_rejected() {
        assert_eq!(decode_sample(b"HELLO"), Err(WireError::UnknownTag));

        let message = encode_sample(0.5, 300, WireVersion::V1).unwrap();
        // cut inside the level
        let cut = &message[..message.len() - 2];
        assert_eq!(decode_sample(cut), Err(WireError::Malformed));

        // unknown frame variant
        let mut bogus = FRAME_TAG.to_vec();
        bogus.extend([7, 0, 0, 0, 0, 0]);
        assert_eq!(decode_sample(&bogus), Err(WireError::Malformed));
    }

    #[test]
    fn non_finite_levels_are_rejected() {
        assert_eq!(
            decode_sample(&f32::NAN.to_le_bytes()),
            Err(WireError::NonFinite)
        );

        let message = encode_sample(f32::INFINITY, 1, WireVersion::V1).unwrap();
        assert_eq!(decode_sample(&message), Err(WireError::NonFinite));
    }
}
