//! Minimal BER-TLV helpers.
//!
//! Two consumers: the Secure Messaging data objects (single-byte tags,
//! definite lengths) and the leading header of every elementary file, whose
//! declared length drives the chunked read loop.

use std::fmt;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TlvError {
    Truncated,
    InvalidLength,
    TagTooLong,
}
impl fmt::Display for TlvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "TLV data ends before tag and length are complete"),
            Self::InvalidLength => write!(f, "TLV length is malformed"),
            Self::TagTooLong => write!(f, "TLV tag is longer than two bytes"),
        }
    }
}
impl std::error::Error for TlvError {
}


/// Encode a definite-form length in its minimum canonical encoding.
pub fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length.try_into().unwrap());
    } else {
        // 0b1nnn_nnnn and then n bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let mut trimmed = &length_bytes[..];
        while trimmed[0] == 0x00 {
            trimmed = &trimmed[1..];
        }
        output.push(0b1000_0000 | u8::try_from(trimmed.len()).unwrap());
        output.extend_from_slice(trimmed);
    }
}


/// Decode a definite-form length from the beginning of the input.
///
/// Returns `(length, rest)` where `rest` is the input with the length
/// removed. Indefinite lengths and lengths that overflow `usize` return
/// `None`.
pub fn decode_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start, rest) = input.split_first()?;
    if start & 0b1000_0000 == 0 {
        return Some((start.into(), rest));
    }

    let byte_count: usize = (start & 0b0111_1111).into();
    if byte_count == 0 || byte_count > rest.len() {
        return None;
    }
    let mut length: usize = 0;
    for &b in &rest[..byte_count] {
        length = length.checked_mul(256)?;
        length = length.checked_add(b.into())?;
    }
    Some((length, &rest[byte_count..]))
}


/// The decoded leading header of an elementary file.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileHeader {
    pub tag: u16,
    /// Bytes the tag and length occupy.
    pub header_len: usize,
    /// Declared length of the value that follows.
    pub value_len: usize,
}

/// Decode the tag and length at the front of an elementary file.
///
/// The standardised files carry one-byte tags; two-byte tags (low five bits
/// of the first byte all set) are accepted for the biometric groups.
pub fn read_file_header(prefix: &[u8]) -> Result<FileHeader, TlvError> {
    let first = *prefix.first().ok_or(TlvError::Truncated)?;
    let (tag, tag_len) = if first & 0x1F == 0x1F {
        let second = *prefix.get(1).ok_or(TlvError::Truncated)?;
        if second & 0x80 != 0 {
            return Err(TlvError::TagTooLong);
        }
        (u16::from_be_bytes([first, second]), 2)
    } else {
        (first.into(), 1)
    };

    let (value_len, rest) = decode_length(&prefix[tag_len..]).ok_or(TlvError::InvalidLength)?;
    Ok(FileHeader {
        tag,
        header_len: prefix.len() - rest.len(),
        value_len,
    })
}
