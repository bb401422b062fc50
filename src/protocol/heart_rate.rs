//! Heart Rate Measurement decoding.
//!
//! Decodes notifications from the standard Heart Rate Measurement
//! characteristic (0x2A37). Only the measurement value itself is read; the
//! sensor-contact, energy-expended and RR-interval fields are ignored.

use std::fmt;

use thiserror::Error;

/// Flags bit 0: the measurement value is a little-endian `u16` instead of a `u8`.
const FLAG_VALUE_FORMAT_U16: u8 = 0x01;

/// Width of the measurement value selected by the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueFormat {
    /// Single byte at offset 1.
    Uint8,
    /// Two bytes, little-endian, at offsets 1..3.
    Uint16,
}

impl ValueFormat {
    /// Select the format from the flags byte.
    pub fn from_flags(flags: u8) -> Self {
        if flags & FLAG_VALUE_FORMAT_U16 == 0 {
            Self::Uint8
        } else {
            Self::Uint16
        }
    }

    /// Minimum payload length (flags byte included) for this format.
    pub fn required_len(&self) -> usize {
        match self {
            Self::Uint8 => 2,
            Self::Uint16 => 3,
        }
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint8 => write!(f, "uint8"),
            Self::Uint16 => write!(f, "uint16"),
        }
    }
}

/// Reasons a notification payload cannot be decoded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The notification carried no bytes at all.
    #[error("empty payload")]
    EmptyPayload,

    /// The payload is shorter than the format announced by its flags byte.
    #[error("truncated {format} payload: {actual} bytes (need at least {needed})")]
    Truncated {
        /// Format announced by the flags byte.
        format: ValueFormat,
        /// Bytes required for that format.
        needed: usize,
        /// Bytes actually received.
        actual: usize,
    },
}

/// Decode a raw Heart Rate Measurement notification into beats per minute.
///
/// Layout:
/// - Byte 0: flags (bit 0 selects the value width)
/// - Byte 1 (uint8) or bytes 1-2 (uint16 little-endian): heart rate
///
/// # Errors
///
/// Returns [`DecodeError::EmptyPayload`] for an empty slice and
/// [`DecodeError::Truncated`] when the slice is too short for the
/// announced format.
///
/// # Example
///
/// ```
/// use heartrate_bridge::protocol::decode;
///
/// assert_eq!(decode(&[0x00, 0x46]), Ok(70));
/// assert_eq!(decode(&[0x01, 0x8C, 0x00]), Ok(140));
/// ```
pub fn decode(data: &[u8]) -> Result<u16, DecodeError> {
    let flags = *data.first().ok_or(DecodeError::EmptyPayload)?;
    let format = ValueFormat::from_flags(flags);

    if data.len() < format.required_len() {
        return Err(DecodeError::Truncated {
            format,
            needed: format.required_len(),
            actual: data.len(),
        });
    }

    let bpm = match format {
        ValueFormat::Uint8 => u16::from(data[1]),
        ValueFormat::Uint16 => u16::from_le_bytes([data[1], data[2]]),
    };

    Ok(bpm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_payload() {
        assert_eq!(decode(&[]), Err(DecodeError::EmptyPayload));
    }

    #[test]
    fn test_uint8_value() {
        assert_eq!(decode(&[0x00, 0x46]), Ok(70));
        assert_eq!(decode(&[0x00, 0x4B]), Ok(75));
    }

    #[test]
    fn test_uint16_value() {
        assert_eq!(decode(&[0x01, 0x8C, 0x00]), Ok(140));
        assert_eq!(decode(&[0x01, 0x2C, 0x01]), Ok(300));
    }

    #[test]
    fn test_uint16_truncated() {
        assert_eq!(
            decode(&[0x01, 0x8C]),
            Err(DecodeError::Truncated {
                format: ValueFormat::Uint16,
                needed: 3,
                actual: 2,
            })
        );
    }

    #[test]
    fn test_flags_only() {
        assert!(matches!(
            decode(&[0x00]),
            Err(DecodeError::Truncated {
                format: ValueFormat::Uint8,
                ..
            })
        ));
    }

    #[test]
    fn test_other_flag_bits_ignored() {
        // Sensor contact, energy expended and RR interval bits set, followed by
        // RR data the decoder must not look at.
        assert_eq!(decode(&[0x16, 0x48, 0x00, 0x03, 0x10, 0x04]), Ok(72));
        assert_eq!(decode(&[0x1F, 0x48, 0x00, 0x03, 0x10]), Ok(72));
    }

    #[test]
    fn test_decode_is_repeatable() {
        let payload = [0x00, 0x50];
        assert_eq!(decode(&payload), decode(&payload));
    }

    #[test]
    fn test_truncated_display() {
        let err = decode(&[0x01, 0x8C]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "truncated uint16 payload: 2 bytes (need at least 3)"
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = decode(&data);
        }

        #[test]
        fn uint8_payloads_decode_second_byte(
            value: u8,
            tail in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let mut data = vec![0x00, value];
            data.extend(tail);
            prop_assert_eq!(decode(&data), Ok(u16::from(value)));
        }

        #[test]
        fn uint16_payloads_decode_little_endian(value: u16) {
            let [lo, hi] = value.to_le_bytes();
            prop_assert_eq!(decode(&[0x01, lo, hi]), Ok(value));
        }
    }
}
