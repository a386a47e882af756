//! Card command primitives.
//!
//! [`Icc`] is a thin state carrier around the transport: it knows the
//! instruction bytes and parameter semantics of the commands the higher
//! layers need, and it routes every exchange through the Secure Messaging
//! channel once one is installed.

use std::fmt;

use tracing::trace;

use crate::iso7816::apdu::{self, CommandApdu, ResponseApdu, NE_SHORT_MAX};
use crate::iso7816::status::StatusWord;
use crate::secure_messaging::{self, SecureChannel};
use crate::tlv;
use crate::transport::{CardTransport, TransportError};


const INS_SELECT_FILE: u8 = 0xA4;
const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;
const INS_GET_CHALLENGE: u8 = 0x84;
const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
const INS_READ_BINARY: u8 = 0xB0;
const INS_READ_BINARY_ODD: u8 = 0xB1;

/// Largest file offset addressable by READ BINARY with the offset in P1-P2
/// (bit 8 of P1 must stay clear).
pub const SHORT_OFFSET_MAX: usize = 0x7FFF;


#[derive(Debug)]
pub enum IccError {
    Transport(TransportError),
    Write(apdu::WriteError),
    ShortResponse,
    SecureMessaging(secure_messaging::Error),
    /// The card answered with a non-success status word. Any data that
    /// arrived alongside it is preserved; the read loop needs it.
    Command { status: StatusWord, data: Vec<u8> },
    ResponseFormat { expected: &'static str },
    OffsetTooLarge { offset: usize },
    InvalidShortFileId { sfi: u8 },
}
impl fmt::Display for IccError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Transport(e)
                => write!(f, "{}", e),
            Self::Write(e)
                => write!(f, "APDU write error: {}", e),
            Self::ShortResponse
                => write!(f, "response shorter than a status word"),
            Self::SecureMessaging(e)
                => write!(f, "secure messaging error: {}", e),
            Self::Command { status, data }
                => write!(f, "command failed with status {} after {} data bytes", status, data.len()),
            Self::ResponseFormat { expected }
                => write!(f, "response format invalid: expected {}", expected),
            Self::OffsetTooLarge { offset }
                => write!(f, "file offset {} not addressable", offset),
            Self::InvalidShortFileId { sfi }
                => write!(f, "short file identifier 0x{:02X} out of range", sfi),
        }
    }
}
impl std::error::Error for IccError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Write(e) => Some(e),
            Self::ShortResponse => None,
            Self::SecureMessaging(e) => Some(e),
            Self::Command { .. } => None,
            Self::ResponseFormat { .. } => None,
            Self::OffsetTooLarge { .. } => None,
            Self::InvalidShortFileId { .. } => None,
        }
    }
}
impl From<TransportError> for IccError {
    fn from(value: TransportError) -> Self { Self::Transport(value) }
}
impl From<apdu::WriteError> for IccError {
    fn from(value: apdu::WriteError) -> Self { Self::Write(value) }
}
impl From<secure_messaging::Error> for IccError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}


/// The SELECT FILE addressing variants of ISO/IEC 7816-4 (P1).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FileSelection {
    /// The Master File, selected by its reserved identifier `3F00`.
    MasterFile,
    /// Any file by two-byte identifier (P1 = 0x00).
    ById(u16),
    /// A child DF of the current DF (P1 = 0x01).
    ChildDf(u16),
    /// An EF under the current DF (P1 = 0x02).
    ChildEf(u16),
    /// The parent DF of the current DF (P1 = 0x03).
    ParentDf,
    /// A DF by name, usually an application identifier (P1 = 0x04).
    DfName(Vec<u8>),
    /// A path of file identifiers starting below the MF (P1 = 0x08).
    PathFromMf(Vec<u8>),
    /// A path of file identifiers starting below the current DF (P1 = 0x09).
    PathFromCurrentDf(Vec<u8>),
}
impl FileSelection {
    fn p1(&self) -> u8 {
        match self {
            Self::MasterFile => 0x00,
            Self::ById(_) => 0x00,
            Self::ChildDf(_) => 0x01,
            Self::ChildEf(_) => 0x02,
            Self::ParentDf => 0x03,
            Self::DfName(_) => 0x04,
            Self::PathFromMf(_) => 0x08,
            Self::PathFromCurrentDf(_) => 0x09,
        }
    }

    fn data(&self) -> Vec<u8> {
        match self {
            Self::MasterFile => vec![0x3F, 0x00],
            Self::ById(id)|Self::ChildDf(id)|Self::ChildEf(id) => id.to_be_bytes().to_vec(),
            Self::ParentDf => Vec::new(),
            Self::DfName(name) => name.clone(),
            Self::PathFromMf(path)|Self::PathFromCurrentDf(path) => path.clone(),
        }
    }
}


/// A connected card and, once BAC has run, its Secure Messaging channel.
pub struct Icc {
    transport: Box<dyn CardTransport>,
    secure_channel: Option<SecureChannel>,
}
impl Icc {
    pub fn new(transport: Box<dyn CardTransport>) -> Self {
        Self {
            transport,
            secure_channel: None,
        }
    }

    pub fn transport(&self) -> &dyn CardTransport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn CardTransport {
        self.transport.as_mut()
    }

    pub fn set_secure_channel(&mut self, channel: SecureChannel) {
        self.secure_channel = Some(channel);
    }

    pub fn clear_secure_channel(&mut self) {
        self.secure_channel = None;
    }

    pub fn has_secure_channel(&self) -> bool {
        self.secure_channel.is_some()
    }

    /// Send one command APDU and decode the response, protecting and
    /// unprotecting through the Secure Messaging channel when one is
    /// installed. The response is returned whatever its status word says.
    fn exchange(&mut self, command: &CommandApdu) -> Result<ResponseApdu, IccError> {
        let wire = match self.secure_channel.as_mut() {
            Some(channel) => channel.protect(command),
            None => command.clone(),
        };
        let request = wire.to_bytes()?;
        trace!(apdu = %crate::hex_str(&request), "sending");
        let raw = self.transport.transceive(&request)?;
        trace!(apdu = %crate::hex_str(&raw), "received");

        let response = ResponseApdu::from_bytes(&raw).ok_or(IccError::ShortResponse)?;
        match self.secure_channel.as_mut() {
            Some(channel) => match channel.unprotect(&response) {
                Ok(plain) => Ok(plain),
                Err(e) => {
                    // a verification failure ends the session for good;
                    // BAC may be re-run to install a fresh channel
                    self.secure_channel = None;
                    Err(e.into())
                },
            },
            None => Ok(response),
        }
    }

    fn command(&mut self, command: &CommandApdu) -> Result<ResponseApdu, IccError> {
        let response = self.exchange(command)?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(IccError::Command { status, data: response.data })
        }
    }

    pub fn select_file(&mut self, selection: FileSelection) -> Result<ResponseApdu, IccError> {
        let data = selection.data();
        let mut command = CommandApdu::new(0x00, INS_SELECT_FILE, selection.p1(), 0x0C);
        if !data.is_empty() {
            command = command.with_data(data);
        }
        self.command(&command)
    }

    pub fn get_challenge(&mut self) -> Result<[u8; 8], IccError> {
        let command = CommandApdu::new(0x00, INS_GET_CHALLENGE, 0x00, 0x00).expecting(8);
        let response = self.command(&command)?;
        response
            .data
            .as_slice()
            .try_into()
            .map_err(|_| IccError::ResponseFormat { expected: "an 8-byte challenge" })
    }

    pub fn external_authenticate(
        &mut self,
        data: Vec<u8>,
        ne: usize,
    ) -> Result<ResponseApdu, IccError> {
        let command = CommandApdu::new(0x00, INS_EXTERNAL_AUTHENTICATE, 0x00, 0x00)
            .with_data(data)
            .expecting(ne);
        self.command(&command)
    }

    /// INTERNAL AUTHENTICATE with a caller-supplied challenge; the signature
    /// comes back opaque (the Active Authentication pass-through).
    pub fn internal_authenticate(&mut self, challenge: &[u8]) -> Result<Vec<u8>, IccError> {
        let command = CommandApdu::new(0x00, INS_INTERNAL_AUTHENTICATE, 0x00, 0x00)
            .with_data(challenge.to_vec())
            .expecting(NE_SHORT_MAX);
        let response = self.command(&command)?;
        Ok(response.data)
    }

    /// READ BINARY with the offset in P1-P2.
    pub fn read_binary(&mut self, offset: usize, ne: usize) -> Result<ResponseApdu, IccError> {
        if offset > SHORT_OFFSET_MAX {
            return Err(IccError::OffsetTooLarge { offset });
        }
        let offset_bytes = u16::try_from(offset).unwrap().to_be_bytes();
        let command = CommandApdu::new(0x00, INS_READ_BINARY, offset_bytes[0], offset_bytes[1])
            .expecting(ne);
        self.command(&command)
    }

    /// READ BINARY addressing an EF by short file identifier: P1 carries
    /// `0x80 | SFI`, P2 the offset. Selects the file as a side effect.
    pub fn read_binary_sfi(
        &mut self,
        sfi: u8,
        offset: u8,
        ne: usize,
    ) -> Result<ResponseApdu, IccError> {
        if sfi > 0x1F {
            return Err(IccError::InvalidShortFileId { sfi });
        }
        let command = CommandApdu::new(0x00, INS_READ_BINARY, 0x80 | sfi, offset).expecting(ne);
        self.command(&command)
    }

    /// READ BINARY with the odd instruction byte: the offset travels in a
    /// DO'54' in the command data and the file content comes back wrapped in
    /// a DO'53'.
    pub fn read_binary_extended(
        &mut self,
        offset: usize,
        ne: usize,
    ) -> Result<ResponseApdu, IccError> {
        if offset > 0x7FFF_FFFF {
            return Err(IccError::OffsetTooLarge { offset });
        }
        let offset_bytes = u32::try_from(offset).unwrap().to_be_bytes();
        let mut trimmed = &offset_bytes[..];
        while trimmed.len() > 1 && trimmed[0] == 0x00 {
            trimmed = &trimmed[1..];
        }
        let mut data = vec![0x54];
        tlv::encode_length(&mut data, trimmed.len());
        data.extend_from_slice(trimmed);

        let command = CommandApdu::new(0x00, INS_READ_BINARY_ODD, 0x00, 0x00)
            .with_data(data)
            .expecting(ne);
        let response = self.command(&command)?;

        // unwrap the DO'53'
        let payload = response.data.as_slice();
        if payload.first() != Some(&0x53) {
            return Err(IccError::ResponseFormat { expected: "a DO'53' wrapped payload" });
        }
        let (length, value) = tlv::decode_length(&payload[1..])
            .ok_or(IccError::ResponseFormat { expected: "a DO'53' wrapped payload" })?;
        if length > value.len() {
            return Err(IccError::ResponseFormat { expected: "a DO'53' wrapped payload" });
        }
        Ok(ResponseApdu {
            data: value[..length].to_vec(),
            sw1: response.sw1,
            sw2: response.sw2,
        })
    }
}
