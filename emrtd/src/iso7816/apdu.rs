//! Structures related to application protocol data units (APDUs).

use std::fmt;
use std::io::{self, Write};

use crate::iso7816::status::StatusWord;


/// Largest expected-response length encodable in a short-form APDU.
pub const NE_SHORT_MAX: usize = 256;
/// Largest expected-response length encodable in an extended-form APDU.
pub const NE_EXTENDED_MAX: usize = 65536;
/// Largest command data field encodable in a short-form APDU.
pub const LC_SHORT_MAX: usize = 255;
/// Largest command data field encodable in an extended-form APDU.
pub const LC_EXTENDED_MAX: usize = 65535;


#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    DataTooLong { obtained: usize },
    ExpectedLengthTooLong { obtained: usize },
}
impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)
                => write!(f, "I/O error: {}", e),
            Self::DataTooLong { obtained }
                => write!(f, "too much command data: {} bytes, maximum is {}", obtained, LC_EXTENDED_MAX),
            Self::ExpectedLengthTooLong { obtained }
                => write!(f, "expected response length {} exceeds maximum {}", obtained, NE_EXTENDED_MAX),
        }
    }
}
impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::DataTooLong { .. } => None,
            Self::ExpectedLengthTooLong { .. } => None,
        }
    }
}
impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}


/// A command APDU.
///
/// `ne` is the number of response data bytes expected: 0 means none, 256 is
/// the short-form maximum and 65536 the extended-form maximum. The encoding
/// stays in short form exactly as long as the data field fits in 255 bytes
/// and `ne` does not exceed 256.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub ne: usize,
}
impl CommandApdu {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            ne: 0,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn expecting(mut self, ne: usize) -> Self {
        self.ne = ne;
        self
    }

    pub const fn header_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub fn is_extended(&self) -> bool {
        self.data.len() > LC_SHORT_MAX || self.ne > NE_SHORT_MAX
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        if self.data.len() > LC_EXTENDED_MAX {
            return Err(WriteError::DataTooLong { obtained: self.data.len() });
        }
        if self.ne > NE_EXTENDED_MAX {
            return Err(WriteError::ExpectedLengthTooLong { obtained: self.ne });
        }

        writer.write_all(&self.header_bytes())?;

        // "case" refers to the cases in ISO/IEC 7816-3:2006 § 12.1.3
        if self.is_extended() {
            if !self.data.is_empty() {
                // case 3E/4E: [0x00] [LcMSB] [LcLSB] [Data]
                let lc: u16 = self.data.len().try_into().unwrap();
                writer.write_all(&[0x00])?;
                writer.write_all(&lc.to_be_bytes())?;
                writer.write_all(&self.data)?;
                if self.ne > 0 {
                    // case 4E: two-byte Le, 65536 encoded as zero
                    let le: u16 = if self.ne == NE_EXTENDED_MAX {
                        0x0000
                    } else {
                        self.ne.try_into().unwrap()
                    };
                    writer.write_all(&le.to_be_bytes())?;
                }
            } else if self.ne > 0 {
                // case 2E: [0x00] [LeMSB] [LeLSB], 65536 encoded as zero
                let le: u16 = if self.ne == NE_EXTENDED_MAX {
                    0x0000
                } else {
                    self.ne.try_into().unwrap()
                };
                writer.write_all(&[0x00])?;
                writer.write_all(&le.to_be_bytes())?;
            }
        } else {
            if !self.data.is_empty() {
                // case 3S/4S: [Lc] [Data]
                let lc: u8 = self.data.len().try_into().unwrap();
                writer.write_all(&[lc])?;
                writer.write_all(&self.data)?;
            }
            if self.ne > 0 {
                // case 2S/4S: [Le], 256 encoded as zero
                let le: u8 = if self.ne == NE_SHORT_MAX {
                    0x00
                } else {
                    self.ne.try_into().unwrap()
                };
                writer.write_all(&[le])?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut buf = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        self.write_bytes(&mut buf)?;
        Ok(buf)
    }
}
impl fmt::Debug for CommandApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandApdu {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X}, data: {}, ne: {} {}",
            '{', self.cla, self.ins, self.p1, self.p2, crate::hex_str(&self.data), self.ne, '}',
        )
    }
}


/// A response APDU: a data field followed by the two status bytes.
///
/// Decoding is total for any input of at least two bytes; interpreting the
/// status word is the caller's business.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseApdu {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        Some(Self {
            data: bytes[..bytes.len() - 2].to_vec(),
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        })
    }

    pub const fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub fn status(&self) -> StatusWord {
        StatusWord::from_word(self.status_word())
    }
}
impl fmt::Debug for ResponseApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResponseApdu {} data: {}, sw: 0x{:04X} {}",
            '{', crate::hex_str(&self.data), self.status_word(), '}',
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use hex_literal::hex;

    fn encoded(apdu: &CommandApdu) -> Vec<u8> {
        apdu.to_bytes().expect("encoding failed")
    }

    #[test]
    fn case_1_is_just_the_header() {
        let apdu = CommandApdu::new(0x00, 0xA4, 0x00, 0x0C);
        assert_eq!(encoded(&apdu), hex!("00 A4 00 0C"));
    }

    #[test]
    fn select_emrtd_application_by_df_name() {
        // Doc 9303 SELECT of AID A0000002471001
        let apdu = CommandApdu::new(0x00, 0xA4, 0x04, 0x0C)
            .with_data(hex!("A0 00 00 02 47 10 01").to_vec());
        assert_eq!(encoded(&apdu), hex!("00 A4 04 0C 07 A0 00 00 02 47 10 01"));
    }

    #[test]
    fn short_le_256_encodes_as_zero() {
        let apdu = CommandApdu::new(0x00, 0xB0, 0x00, 0x00).expecting(256);
        assert_eq!(encoded(&apdu), hex!("00 B0 00 00 00"));
    }

    #[test]
    fn short_case_4() {
        let apdu = CommandApdu::new(0x00, 0x82, 0x00, 0x00)
            .with_data(vec![0xAA; 40])
            .expecting(40);
        let bytes = encoded(&apdu);
        assert_eq!(bytes[4], 40);
        assert_eq!(&bytes[5..45], &[0xAA; 40][..]);
        assert_eq!(bytes[45], 40);
        assert_eq!(bytes.len(), 46);
    }

    #[test]
    fn extended_le_65536_encodes_as_three_zero_bytes() {
        let apdu = CommandApdu::new(0x00, 0xB0, 0x00, 0x00).expecting(65536);
        assert_eq!(encoded(&apdu), hex!("00 B0 00 00 00 00 00"));
    }

    #[test]
    fn ne_above_256_switches_to_extended() {
        let apdu = CommandApdu::new(0x00, 0xB0, 0x00, 0x00).expecting(257);
        assert_eq!(encoded(&apdu), hex!("00 B0 00 00 00 01 01"));
    }

    #[test]
    fn data_above_255_switches_to_extended() {
        let apdu = CommandApdu::new(0x00, 0xD6, 0x00, 0x00).with_data(vec![0x5A; 256]);
        let bytes = encoded(&apdu);
        assert_eq!(&bytes[4..7], &hex!("00 01 00"));
        assert_eq!(bytes.len(), 4 + 3 + 256);
    }

    #[test]
    fn extended_case_4_has_two_byte_le() {
        let apdu = CommandApdu::new(0x00, 0x2A, 0x00, 0x00)
            .with_data(vec![0x11; 300])
            .expecting(65536);
        let bytes = encoded(&apdu);
        assert_eq!(&bytes[4..7], &hex!("00 01 2C"));
        assert_eq!(&bytes[4 + 3 + 300..], &hex!("00 00"));
    }

    #[test]
    fn oversize_fields_are_rejected() {
        let apdu = CommandApdu::new(0x00, 0x00, 0x00, 0x00).with_data(vec![0x00; 65536]);
        assert!(matches!(apdu.to_bytes(), Err(WriteError::DataTooLong { obtained: 65536 })));

        let apdu = CommandApdu::new(0x00, 0x00, 0x00, 0x00).expecting(65537);
        assert!(matches!(apdu.to_bytes(), Err(WriteError::ExpectedLengthTooLong { obtained: 65537 })));
    }

    #[test]
    fn response_decoding_is_total_above_one_byte() {
        assert_eq!(ResponseApdu::from_bytes(&[]), None);
        assert_eq!(ResponseApdu::from_bytes(&[0x90]), None);

        let bare = ResponseApdu::from_bytes(&hex!("90 00")).unwrap();
        assert!(bare.data.is_empty());
        assert_eq!(bare.status_word(), 0x9000);

        let with_data = ResponseApdu::from_bytes(&hex!("60 14 5F 01 61 09")).unwrap();
        assert_eq!(with_data.data, hex!("60 14 5F 01"));
        assert_eq!(with_data.status_word(), 0x6109);
    }
}
