//! Client core for reading electronic Machine-Readable Travel Documents
//! (biometric passports) over a contactless smartcard link.
//!
//! The stack is layered, leaves first: the [`transport`] seam delivers raw
//! bytes, [`iso7816`] encodes and decodes APDUs, [`crypt`] supplies the BAC
//! cipher suite, [`secure_messaging`] wraps and unwraps protected APDUs,
//! [`icc`] issues the card commands, [`bac`] performs the mutual
//! authentication that installs a session, [`mrtd`] reads files fault
//! tolerantly and [`passport`] exposes one typed operation per elementary
//! file.

pub mod bac;
pub mod crypt;
pub mod icc;
pub mod iso7816;
pub mod mrtd;
pub mod passport;
pub mod secure_messaging;
pub mod tlv;
pub mod transport;


/// Renders bytes as contiguous uppercase hex, the format used in trace logs.
pub fn hex_str(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}
