//! Basic Access Control.
//!
//! The legacy password-derived key establishment of ICAO Doc 9303 Part 11
//! § 4.3: both sides prove knowledge of keys derived from the machine
//! readable zone, exchange random key halves under those keys and derive a
//! Secure Messaging session from the XOR of the halves.

use std::fmt;

use block_padding::{Iso7816, RawPadding};
use sha1::{Digest, Sha1};
use tracing::{debug, instrument};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypt;
use crate::icc::{Icc, IccError};
use crate::secure_messaging::SecureChannel;


#[derive(Debug)]
pub enum BacError {
    Icc(IccError),
    InvalidField { field: &'static str },
    ResponseLength { obtained: usize },
    ResponseMac,
    ChallengeMismatch,
}
impl fmt::Display for BacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Icc(e)
                => write!(f, "{}", e),
            Self::InvalidField { field }
                => write!(f, "invalid character or length in {}", field),
            Self::ResponseLength { obtained }
                => write!(f, "EXTERNAL AUTHENTICATE response has length {}, expected 40", obtained),
            Self::ResponseMac
                => write!(f, "EXTERNAL AUTHENTICATE response MAC incorrect"),
            Self::ChallengeMismatch
                => write!(f, "card did not echo the terminal challenge"),
        }
    }
}
impl std::error::Error for BacError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Icc(e) => Some(e),
            Self::InvalidField { .. } => None,
            Self::ResponseLength { .. } => None,
            Self::ResponseMac => None,
            Self::ChallengeMismatch => None,
        }
    }
}
impl From<IccError> for BacError {
    fn from(value: IccError) -> Self { Self::Icc(value) }
}


/// Document Basic Access keying material: the MRZ fields that seed the BAC
/// keys.
#[derive(Clone, ZeroizeOnDrop)]
pub struct BacKey {
    document_number: String,
    birth_date: String,
    expiry_date: String,
}
impl BacKey {
    /// Builds the key from the second MRZ line's fields. The document number
    /// is padded with `<` to the nine characters the MRZ carries; the dates
    /// are `YYMMDD`.
    pub fn new(
        document_number: &str,
        birth_date: &str,
        expiry_date: &str,
    ) -> Result<Self, BacError> {
        fn is_mrz(c: char) -> bool {
            c.is_ascii_uppercase() || c.is_ascii_digit() || c == '<'
        }

        if document_number.is_empty() || !document_number.chars().all(is_mrz) {
            return Err(BacError::InvalidField { field: "document number" });
        }
        for (value, field) in [(birth_date, "birth date"), (expiry_date, "expiry date")] {
            if value.len() != 6 || !value.chars().all(|c| c.is_ascii_digit()) {
                return Err(BacError::InvalidField { field });
            }
        }

        let mut document_number = document_number.to_owned();
        while document_number.len() < 9 {
            document_number.push('<');
        }

        Ok(Self {
            document_number,
            birth_date: birth_date.to_owned(),
            expiry_date: expiry_date.to_owned(),
        })
    }

    /// The BAC key seed: the first 16 bytes of SHA-1 over document number,
    /// birth date and expiry date, each followed by its check digit.
    pub fn seed(&self) -> Zeroizing<[u8; 16]> {
        let mut hasher = Sha1::new();
        for field in [&self.document_number, &self.birth_date, &self.expiry_date] {
            hasher.update(field.as_bytes());
            hasher.update([b'0' + check_digit(field)]);
        }
        let digest = hasher.finalize();

        let mut seed = Zeroizing::new([0u8; 16]);
        seed.copy_from_slice(&digest[0..16]);
        seed
    }
}
impl fmt::Debug for BacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log MRZ key data
        write!(f, "BacKey {} .. {}", '{', '}')
    }
}

/// The ICAO 7-3-1 check digit over the MRZ alphabet.
fn check_digit(field: &str) -> u8 {
    const WEIGHTS: [u32; 3] = [7, 3, 1];

    let mut sum = 0u32;
    for (i, c) in field.chars().enumerate() {
        let value = match c {
            '0'..='9' => c as u32 - '0' as u32,
            'A'..='Z' => c as u32 - 'A' as u32 + 10,
            _ => 0,
        };
        sum += value * WEIGHTS[i % 3];
    }
    (sum % 10) as u8
}


/// Run the BAC handshake and install the resulting Secure Messaging channel
/// into the ICC.
#[instrument(skip_all)]
pub fn establish(icc: &mut Icc, key: &BacKey) -> Result<(), BacError> {
    let seed = key.seed();
    let rnd_ic = icc.get_challenge()?;
    let rnd_ifd = crypt::random_array::<8>();
    let k_ifd = crypt::random_array::<16>();
    establish_from_values(icc, seed.as_slice(), &rnd_ic, &rnd_ifd, &k_ifd)
}

/// The mutual-authentication exchange with every input fixed.
///
/// Split out of [`establish`] so the Doc 9303 worked example can drive it
/// deterministically; the session keys are a pure function of the five
/// inputs and the card's response.
#[instrument(skip_all)]
pub fn establish_from_values(
    icc: &mut Icc,
    k_seed: &[u8],
    rnd_ic: &[u8; 8],
    rnd_ifd: &[u8; 8],
    k_ifd: &[u8; 16],
) -> Result<(), BacError> {
    let k_enc = crypt::derive_encryption_key(k_seed);
    let k_mac = crypt::derive_mac_key(k_seed);

    // S = RND.IFD || RND.IC || K.IFD, encrypted with a zero IV and no
    // padding; the MAC is computed over the padded ciphertext and rides in
    // the eight bytes the padding occupied
    let mut ext_auth_data = Zeroizing::new([0u8; 40]);
    ext_auth_data[0..8].copy_from_slice(rnd_ifd);
    ext_auth_data[8..16].copy_from_slice(rnd_ic);
    ext_auth_data[16..32].copy_from_slice(k_ifd);
    crypt::tdes_cbc_encrypt(&mut ext_auth_data[0..32], &k_enc, &crypt::ZERO_IV);
    Iso7816::raw_pad(ext_auth_data.as_mut_slice(), 32);
    let mac = crypt::retail_mac(&k_mac, ext_auth_data.as_slice());
    ext_auth_data[32..40].copy_from_slice(mac.as_slice());

    let response = icc.external_authenticate(ext_auth_data.to_vec(), 40)?;
    if response.data.len() != 40 {
        return Err(BacError::ResponseLength { obtained: response.data.len() });
    }

    // verify the card's MAC the same way it was produced
    let mut to_verify = Zeroizing::new([0u8; 40]);
    to_verify[0..32].copy_from_slice(&response.data[0..32]);
    Iso7816::raw_pad(to_verify.as_mut_slice(), 32);
    if !crypt::verify_retail_mac(&k_mac, to_verify.as_slice(), &response.data[32..40]) {
        return Err(BacError::ResponseMac);
    }

    let mut decrypted = Zeroizing::new([0u8; 32]);
    decrypted.copy_from_slice(&response.data[0..32]);
    crypt::tdes_cbc_decrypt(decrypted.as_mut_slice(), &k_enc, &crypt::ZERO_IV);

    // the card echoes RND.IC and RND.IFD ahead of its key half
    if decrypted[0..8] != rnd_ic[..] || decrypted[8..16] != rnd_ifd[..] {
        return Err(BacError::ChallengeMismatch);
    }

    let mut session_seed = Zeroizing::new([0u8; 16]);
    for ((seed, ifd), ic) in session_seed.iter_mut().zip(k_ifd).zip(&decrypted[16..32]) {
        *seed = *ifd ^ *ic;
    }

    let ks_enc = crypt::derive_encryption_key(session_seed.as_slice());
    let ks_mac = crypt::derive_mac_key(session_seed.as_slice());

    // SSC: low half of each challenge
    let mut ssc = [0u8; 8];
    ssc[0..4].copy_from_slice(&rnd_ic[4..8]);
    ssc[4..8].copy_from_slice(&rnd_ifd[4..8]);

    icc.set_secure_channel(SecureChannel::new(*ks_enc, *ks_mac, ssc));
    debug!("secure messaging session established");
    Ok(())
}
