//! Cryptographic primitives for the BAC profile: two-key 3DES in CBC mode,
//! the ISO/IEC 9797-1 algorithm 3 "retail MAC", the Doc 9303 key derivation
//! function and ISO 7816 padding.
//!
//! Encryption and decryption work in place over pre-padded buffers, so key
//! material and plaintext never need an extra copy. The block functions are
//! allowed to panic if the caller hands them a buffer that is not
//! block-aligned.

use cipher::block_padding::NoPadding;
use cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit, KeyInit};
use des::{Des, TdesEde2};
use digest::{Digest, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use retail_mac::RetailMac;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;


/// Block size of DES and 3DES in bytes.
pub const BLOCK_LEN: usize = 8;

/// The CBC IV for Secure Messaging and BAC (Doc 9303 Part 11 § 9.8.6.1: the
/// IV is always zero for the 3DES profile).
pub const ZERO_IV: [u8; 8] = [0; 8];


/// The Doc 9303 key derivation function for the 3DES profile.
///
/// `SHA-1(seed ‖ counter)`, truncated to 16 bytes and adjusted to odd DES
/// parity. The result is used as a two-key EDE schedule `K1 ‖ K2`.
pub fn derive_key(key_seed: &[u8], counter: u32) -> Zeroizing<[u8; 16]> {
    let mut hasher = Sha1::new();
    hasher.update(key_seed);
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();

    let mut key = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&digest[0..16]);
    adjust_des_parity(key.as_mut_slice());
    key
}

/// Counter 1 of [`derive_key`]: the encryption key.
pub fn derive_encryption_key(key_seed: &[u8]) -> Zeroizing<[u8; 16]> {
    derive_key(key_seed, 1)
}

/// Counter 2 of [`derive_key`]: the MAC key.
pub fn derive_mac_key(key_seed: &[u8]) -> Zeroizing<[u8; 16]> {
    derive_key(key_seed, 2)
}

/// Force every byte of a DES key to odd parity.
///
/// The cipher ignores the parity bits; the adjustment only matters for
/// matching the reference key values in Doc 9303.
pub fn adjust_des_parity(key: &mut [u8]) {
    for b in key.iter_mut() {
        if b.count_ones() % 2 == 0 {
            *b ^= 0x01;
        }
    }
}


/// Append ISO 7816 padding: a mandatory `0x80`, then zeros to the next block
/// boundary.
pub fn pad_iso7816(data: &mut Vec<u8>) {
    data.push(0x80);
    while data.len() % BLOCK_LEN != 0 {
        data.push(0x00);
    }
}

/// Strip ISO 7816 padding. Unambiguous: the last non-zero byte must be
/// `0x80`. Returns `None` if it is not.
pub fn strip_iso7816_padding(data: &[u8]) -> Option<&[u8]> {
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0x00 {
        end -= 1;
    }
    if end == 0 || data[end - 1] != 0x80 {
        return None;
    }
    Some(&data[..end - 1])
}


/// Encrypt a pre-padded buffer in place with two-key 3DES in CBC mode.
pub fn tdes_cbc_encrypt(data: &mut [u8], key: &[u8; 16], iv: &[u8; 8]) {
    let encryptor = cbc::Encryptor::<TdesEde2>::new(key.into(), iv.into());
    let len = data.len();
    encryptor
        .encrypt_padded::<NoPadding>(data, len)
        .expect("input must be block-aligned");
}

/// Decrypt a buffer in place with two-key 3DES in CBC mode. Padding is not
/// stripped.
pub fn tdes_cbc_decrypt(data: &mut [u8], key: &[u8; 16], iv: &[u8; 8]) {
    let decryptor = cbc::Decryptor::<TdesEde2>::new(key.into(), iv.into());
    decryptor
        .decrypt_padded::<NoPadding>(data)
        .expect("input must be block-aligned");
}


/// ISO/IEC 9797-1 MAC algorithm 3 over pre-padded data: a single-DES CBC-MAC
/// under `K1` with the final block run through `DES_DEC(K2)` and
/// `DES_ENC(K1)`.
pub fn retail_mac(key: &[u8; 16], data: &[u8]) -> Zeroizing<[u8; 8]> {
    let mut mac = RetailMac::<Des>::new_from_slice(key).expect("retail MAC key must be 16 bytes");
    Mac::update(&mut mac, data);
    let tag = mac.finalize().into_bytes();

    let mut out = Zeroizing::new([0u8; 8]);
    out.copy_from_slice(&tag);
    out
}

/// Constant-time comparison of [`retail_mac`] output against a received MAC.
pub fn verify_retail_mac(key: &[u8; 16], data: &[u8], expected: &[u8]) -> bool {
    let computed = retail_mac(key, data);
    computed.ct_eq(expected).into()
}


/// Cryptographically secure random bytes from the operating system.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}


#[cfg(test)]
mod tests {
    use super::*;

    use hex_literal::hex;

    // Doc 9303 Part 11 Appendix D.1
    const K_SEED: [u8; 16] = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");

    #[test]
    fn derive_key_matches_the_doc_9303_worked_example() {
        assert_eq!(
            derive_encryption_key(&K_SEED).as_slice(),
            hex!("AB94FDECF2674FDFB9B391F85D7F76F2"),
        );
        assert_eq!(
            derive_mac_key(&K_SEED).as_slice(),
            hex!("7962D9ECE03D1ACD4C76089DCE131543"),
        );
    }

    #[test]
    fn derive_key_matches_the_session_key_example() {
        // Appendix D.2: session keys from the XORed key seed
        let seed = hex!("0036D272F5C350ACAC50C3F572D23600");
        assert_eq!(
            derive_encryption_key(&seed).as_slice(),
            hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"),
        );
        assert_eq!(
            derive_mac_key(&seed).as_slice(),
            hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"),
        );
    }

    #[test]
    fn parity_adjustment_is_idempotent() {
        let mut key = hex!("AB94FDECF2674FDFB9B391F85D7F76F2");
        adjust_des_parity(&mut key);
        assert_eq!(key, hex!("AB94FDECF2674FDFB9B391F85D7F76F2"));
        for b in key {
            assert_eq!(b.count_ones() % 2, 1);
        }
    }

    #[test]
    fn padding_round_trips() {
        for len in 0..=24 {
            let mut data = vec![0xA5u8; len];
            pad_iso7816(&mut data);
            assert_eq!(data.len() % BLOCK_LEN, 0);
            assert!(data.len() > len);
            assert_eq!(strip_iso7816_padding(&data), Some(&vec![0xA5u8; len][..]));
        }
    }

    #[test]
    fn padding_without_the_marker_is_rejected() {
        assert_eq!(strip_iso7816_padding(&[0x00; 8]), None);
        assert_eq!(strip_iso7816_padding(&hex!("AA BB 00 00 00 00 00 00")), None);
        assert_eq!(strip_iso7816_padding(&[]), None);
    }

    #[test]
    fn tdes_cbc_round_trips() {
        let key = derive_encryption_key(&K_SEED);
        let mut data = Vec::from(hex!("0011223344556677 8899AABBCCDDEEFF"));
        let original = data.clone();
        tdes_cbc_encrypt(&mut data, &key, &ZERO_IV);
        assert_ne!(data, original);
        tdes_cbc_decrypt(&mut data, &key, &ZERO_IV);
        assert_eq!(data, original);
    }

    #[test]
    fn bac_challenge_encryption_matches_the_worked_example() {
        // Appendix D.3: E.IFD and M.IFD
        let k_enc = derive_encryption_key(&K_SEED);
        let k_mac = derive_mac_key(&K_SEED);
        let mut s = Vec::from(hex!(
            "781723860C06C226 4608F91988702212 0B795240CB7049B0 1C19B33E32804F0B"
        ));
        tdes_cbc_encrypt(&mut s, &k_enc, &ZERO_IV);
        assert_eq!(
            s,
            hex!("72C29C2371CC9BDB 65B779B8E8D37B29 ECC154AA56A8799F AE2F498F76ED92F2"),
        );

        pad_iso7816(&mut s);
        assert_eq!(retail_mac(&k_mac, &s).as_slice(), hex!("5F1448EEA8AD90A7"));
    }

    #[test]
    fn padding_an_aligned_message_changes_the_mac() {
        let k_mac = derive_mac_key(&K_SEED);
        let mut message = Vec::from(hex!("00112233445566"));
        pad_iso7816(&mut message);
        let direct = retail_mac(&k_mac, &message);

        // padding an already block-aligned message appends a full block
        let mut repadded = message.clone();
        pad_iso7816(&mut repadded);
        assert_eq!(repadded.len(), message.len() + BLOCK_LEN);
        assert_ne!(retail_mac(&k_mac, &repadded).as_slice(), direct.as_slice());
    }

    #[test]
    fn mac_verification_is_exact() {
        let k_mac = derive_mac_key(&K_SEED);
        let mut message = Vec::from(hex!("DEADBEEF"));
        pad_iso7816(&mut message);
        let mac = retail_mac(&k_mac, &message);
        assert!(verify_retail_mac(&k_mac, &message, mac.as_slice()));

        let mut tampered = *mac;
        tampered[0] ^= 0x01;
        assert!(!verify_retail_mac(&k_mac, &message, &tampered));
        assert!(!verify_retail_mac(&k_mac, &message, &mac.as_slice()[..7]));
    }

    #[test]
    fn random_arrays_are_filled() {
        // smoke test only: two draws colliding on 16 bytes is negligible
        let a = random_array::<16>();
        let b = random_array::<16>();
        assert_ne!(a, b);
    }
}
