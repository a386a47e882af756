//! Secure Messaging for the BAC profile.
//!
//! Every command APDU sent after BAC is wrapped into data objects (DO'87'
//! for the encrypted body, DO'97' for the expected length, DO'8E' for the
//! MAC) and every response is verified and unwrapped on the way back. The
//! channel is a pure function of the session keys and the send-sequence
//! counter; it holds no reference to the card.

use std::fmt;

use tracing::trace;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypt;
use crate::iso7816::apdu::{CommandApdu, ResponseApdu, LC_SHORT_MAX, NE_EXTENDED_MAX, NE_SHORT_MAX};
use crate::tlv;


#[derive(Debug)]
pub enum Error {
    ResponseTlvFormat,
    MissingResponseMac,
    MissingResponseStatus,
    ResponseMac,
    StatusLength { obtained: usize },
    UnknownPadding { indicator: u8 },
    InvalidPadding,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::ResponseTlvFormat
                => write!(f, "protected response has an invalid TLV format"),
            Self::MissingResponseMac
                => write!(f, "protected response does not contain a MAC"),
            Self::MissingResponseStatus
                => write!(f, "protected response does not contain a status data object"),
            Self::ResponseMac
                => write!(f, "response MAC incorrect"),
            Self::StatusLength { obtained }
                => write!(f, "protected status has unexpected length {}", obtained),
            Self::UnknownPadding { indicator }
                => write!(f, "response payload has unknown padding indicator {}", indicator),
            Self::InvalidPadding
                => write!(f, "response payload has invalid padding"),
        }
    }
}
impl std::error::Error for Error {
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct BorrowedTlv<'d> {
    tag_and_length: &'d [u8],
    data: &'d [u8],
}

fn split_data_objects(mut slice: &[u8]) -> Result<Vec<BorrowedTlv<'_>>, Error> {
    let mut fields = Vec::new();
    while !slice.is_empty() {
        if slice.len() < 2 {
            return Err(Error::ResponseTlvFormat);
        }
        let (data_length, rest) =
            tlv::decode_length(&slice[1..]).ok_or(Error::ResponseTlvFormat)?;
        if data_length > rest.len() {
            return Err(Error::ResponseTlvFormat);
        }
        fields.push(BorrowedTlv {
            tag_and_length: &slice[..slice.len() - rest.len()],
            data: &rest[..data_length],
        });
        slice = &rest[data_length..];
    }
    Ok(fields)
}


/// Session state for ICAO Doc 9303 Secure Messaging with 3DES and the retail
/// MAC.
///
/// Installed into the ICC by BAC; discarded on the first cryptographic
/// failure. The send-sequence counter advances before every protected
/// command and before every response verification and never rolls back.
#[derive(ZeroizeOnDrop)]
pub struct SecureChannel {
    ks_enc: [u8; 16],
    ks_mac: [u8; 16],
    ssc: [u8; 8],
}
impl SecureChannel {
    pub fn new(ks_enc: [u8; 16], ks_mac: [u8; 16], ssc: [u8; 8]) -> Self {
        Self { ks_enc, ks_mac, ssc }
    }

    pub fn send_sequence_counter(&self) -> [u8; 8] {
        self.ssc
    }

    fn increment_ssc(&mut self) -> [u8; 8] {
        for b in self.ssc.iter_mut().rev() {
            if *b == 0xFF {
                *b = 0x00;
                // carry; keep going
            } else {
                *b += 1;
                break;
            }
        }
        self.ssc
    }

    /// Wrap an unprotected command into its Secure Messaging form.
    pub fn protect(&mut self, command: &CommandApdu) -> CommandApdu {
        let ssc = self.increment_ssc();

        // secure messaging, command header authenticated, no chaining
        let cla = command.cla | 0x0C;

        // MAC input starts with the SSC and the padded protected header
        let mut mac_data = Zeroizing::new(Vec::new());
        mac_data.extend_from_slice(&ssc);
        mac_data.extend_from_slice(&[cla, command.ins, command.p1, command.p2]);
        crypt::pad_iso7816(&mut mac_data);

        let mut body = Vec::new();

        if !command.data.is_empty() {
            let mut padded = Zeroizing::new(command.data.clone());
            crypt::pad_iso7816(&mut padded);
            crypt::tdes_cbc_encrypt(&mut padded, &self.ks_enc, &crypt::ZERO_IV);

            // DO'87': padding indicator 0x01, then the ciphertext
            body.push(0x87);
            tlv::encode_length(&mut body, 1 + padded.len());
            body.push(0x01);
            body.extend_from_slice(&padded);
        }

        if command.ne > 0 {
            // DO'97': the original expected length
            if command.ne > NE_SHORT_MAX {
                let le: u16 = if command.ne == NE_EXTENDED_MAX {
                    0x0000
                } else {
                    command.ne.try_into().unwrap()
                };
                body.push(0x97);
                body.push(0x02);
                body.extend_from_slice(&le.to_be_bytes());
            } else {
                let le: u8 = if command.ne == NE_SHORT_MAX {
                    0x00
                } else {
                    command.ne.try_into().unwrap()
                };
                body.push(0x97);
                body.push(0x01);
                body.push(le);
            }
        }

        mac_data.extend_from_slice(&body);
        crypt::pad_iso7816(&mut mac_data);
        let mac = crypt::retail_mac(&self.ks_mac, &mac_data);

        // DO'8E': the MAC itself
        body.push(0x8E);
        body.push(0x08);
        body.extend_from_slice(mac.as_slice());

        let ne = if body.len() > LC_SHORT_MAX || command.ne > NE_SHORT_MAX {
            NE_EXTENDED_MAX
        } else {
            NE_SHORT_MAX
        };

        CommandApdu {
            cla,
            ins: command.ins,
            p1: command.p1,
            p2: command.p2,
            data: body,
            ne,
        }
    }

    /// Verify and unwrap a protected response.
    ///
    /// The returned APDU carries the decrypted data field and the status
    /// word from DO'99'. Any failure is fatal to the session; the caller
    /// must discard the channel.
    pub fn unprotect(&mut self, response: &ResponseApdu) -> Result<ResponseApdu, Error> {
        let ssc = self.increment_ssc();

        let fields = split_data_objects(&response.data)?;

        // everything with an odd tag except the MAC itself is MAC-protected
        let mut protected_fields = Vec::new();
        let mut received_mac = None;
        for field in &fields {
            let tag = field.tag_and_length[0];
            if tag == 0x8E {
                received_mac = Some(field.data);
            } else if tag & 0x01 != 0 {
                protected_fields.push(field);
            }
        }
        let received_mac = received_mac.ok_or(Error::MissingResponseMac)?;

        let mut mac_data = Zeroizing::new(Vec::new());
        mac_data.extend_from_slice(&ssc);
        for field in &protected_fields {
            mac_data.extend_from_slice(field.tag_and_length);
            mac_data.extend_from_slice(field.data);
        }
        crypt::pad_iso7816(&mut mac_data);
        if !crypt::verify_retail_mac(&self.ks_mac, &mac_data, received_mac) {
            return Err(Error::ResponseMac);
        }

        let status = protected_fields
            .iter()
            .find(|tlv| tlv.tag_and_length[0] == 0x99)
            .ok_or(Error::MissingResponseStatus)?;
        if status.data.len() != 2 {
            return Err(Error::StatusLength { obtained: status.data.len() });
        }

        let data = match protected_fields.iter().find(|tlv| tlv.tag_and_length[0] == 0x87) {
            Some(body) => {
                let (&indicator, ciphertext) =
                    body.data.split_first().ok_or(Error::InvalidPadding)?;
                if indicator != 0x01 {
                    // only ISO 7816 padding is in the BAC profile
                    return Err(Error::UnknownPadding { indicator });
                }
                let mut plaintext = Zeroizing::new(ciphertext.to_vec());
                if plaintext.is_empty() || plaintext.len() % crypt::BLOCK_LEN != 0 {
                    return Err(Error::InvalidPadding);
                }
                crypt::tdes_cbc_decrypt(&mut plaintext, &self.ks_enc, &crypt::ZERO_IV);
                let stripped =
                    crypt::strip_iso7816_padding(&plaintext).ok_or(Error::InvalidPadding)?;
                trace!(data = %crate::hex_str(stripped), "decrypted response data");
                stripped.to_vec()
            },
            None => Vec::new(),
        };

        Ok(ResponseApdu {
            data,
            sw1: status.data[0],
            sw2: status.data[1],
        })
    }
}
