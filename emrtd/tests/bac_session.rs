use emrtd::bac;
use emrtd::crypt;
use emrtd::icc::{FileSelection, Icc};
use emrtd::transport::{CardTransport, TransportError};
use hex_literal::hex;


/// A fake transport that behaves exactly like the card in ICAO Doc 9303
/// Part 11 Appendix D, down to the raw bytes on the wire.
///
/// Any request outside the script is answered with 0x6988.
struct AppendixDTransport {
    state: u8,
    tamper_external_authenticate: bool,
}
impl AppendixDTransport {
    const RND_IC: [u8; 8] = hex!("4608F91988702212");
    const EXPECTED_GET_CHALLENGE: [u8; 5] = hex!("00 84 00 00 08");
    const EXPECTED_EXTERNAL_AUTHENTICATE: [u8; 46] = hex!(
        "0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F2 5F1448EEA8AD90A7 28"
    );
    const EXTERNAL_AUTHENTICATE_RESPONSE: [u8; 40] = hex!(
        "46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D7449"
    );
    const EXPECTED_SELECT_EF_COM: [u8; 27] =
        hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800");
    const SELECT_RESPONSE: [u8; 14] = hex!("990290008E08FA855A5D4C50A8ED");
    const EXPECTED_READ_4: [u8; 19] = hex!("0CB000000D9701048E08ED6705417E96BA5500");
    const READ_4_RESPONSE: [u8; 25] = hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED");
    const EXPECTED_READ_REST: [u8; 19] = hex!("0CB000040D9701128E082EA28A70F3C7B53500");
    const READ_REST_RESPONSE: [u8; 41] = hex!(
        "871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A990290008E08C8B2787EAEA07D74"
    );

    const fn new() -> Self {
        Self {
            state: 0,
            tamper_external_authenticate: false,
        }
    }

    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        if request == Self::EXPECTED_GET_CHALLENGE {
            self.state = 1;
            return [&Self::RND_IC[..], &hex!("9000")].concat();
        }
        if self.state >= 1 && request == Self::EXPECTED_EXTERNAL_AUTHENTICATE {
            self.state = 2;
            let mut response = [&Self::EXTERNAL_AUTHENTICATE_RESPONSE[..], &hex!("9000")].concat();
            if self.tamper_external_authenticate {
                response[0] ^= 0x01;
            }
            return response;
        }
        if self.state >= 2 && request == Self::EXPECTED_SELECT_EF_COM {
            self.state = 3;
            return [&Self::SELECT_RESPONSE[..], &hex!("9000")].concat();
        }
        if self.state >= 3 && request == Self::EXPECTED_READ_4 {
            return [&Self::READ_4_RESPONSE[..], &hex!("9000")].concat();
        }
        if self.state >= 3 && request == Self::EXPECTED_READ_REST {
            return [&Self::READ_REST_RESPONSE[..], &hex!("9000")].concat();
        }
        hex!("6988").to_vec()
    }
}
impl CardTransport for AppendixDTransport {
    fn connect(&mut self, _alert_message: Option<&str>) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(
        &mut self,
        _alert_message: Option<&str>,
        _error_message: Option<&str>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(self.respond(request))
    }
}


const K_SEED: [u8; 16] = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");
const RND_IFD: [u8; 8] = hex!("781723860C06C226");
const K_IFD: [u8; 16] = hex!("0B795240CB7049B01C19B33E32804F0B");


#[test]
fn bac_session_reads_ef_com_like_the_worked_example() {
    let mut icc = Icc::new(Box::new(AppendixDTransport::new()));

    bac::establish_from_values(
        &mut icc,
        &K_SEED,
        &AppendixDTransport::RND_IC,
        &RND_IFD,
        &K_IFD,
    )
    .expect("failed to establish BAC");
    assert!(icc.has_secure_channel());

    let select = icc
        .select_file(FileSelection::ChildEf(0x011E))
        .expect("failed to select EF.COM");
    assert_eq!(select.status_word(), 0x9000);

    let read_four = icc.read_binary(0, 4).expect("failed to read 4 bytes");
    assert_eq!(read_four.data, hex!("60145F01"));

    let read_rest = icc.read_binary(4, 0x12).expect("failed to read the rest");
    assert_eq!(read_rest.data, hex!("04303130365F36063034303030305C026175"));
}

#[test]
fn a_tampered_card_response_fails_the_handshake() {
    let mut transport = AppendixDTransport::new();
    transport.tamper_external_authenticate = true;
    let mut icc = Icc::new(Box::new(transport));

    let result = bac::establish_from_values(
        &mut icc,
        &K_SEED,
        &AppendixDTransport::RND_IC,
        &RND_IFD,
        &K_IFD,
    );
    assert!(matches!(result, Err(bac::BacError::ResponseMac)));
    assert!(!icc.has_secure_channel());
}

/// A card that answers EXTERNAL AUTHENTICATE with a correctly MACed payload
/// that echoes the wrong terminal challenge.
struct WrongEchoTransport;
impl CardTransport for WrongEchoTransport {
    fn connect(&mut self, _alert_message: Option<&str>) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(
        &mut self,
        _alert_message: Option<&str>,
        _error_message: Option<&str>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if request[1] == 0x84 {
            return Ok([&AppendixDTransport::RND_IC[..], &hex!("9000")].concat());
        }
        // build E.ICC with a wrong RND.IFD echo, MAC it correctly
        let k_enc = crypt::derive_encryption_key(&K_SEED);
        let k_mac = crypt::derive_mac_key(&K_SEED);
        let mut body = Vec::new();
        body.extend_from_slice(&AppendixDTransport::RND_IC);
        body.extend_from_slice(&hex!("FFFFFFFFFFFFFFFF"));
        body.extend_from_slice(&[0x11; 16]);
        crypt::tdes_cbc_encrypt(&mut body, &k_enc, &crypt::ZERO_IV);
        let mut mac_input = body.clone();
        crypt::pad_iso7816(&mut mac_input);
        let mac = crypt::retail_mac(&k_mac, &mac_input);
        body.extend_from_slice(mac.as_slice());
        body.extend_from_slice(&hex!("9000"));
        Ok(body)
    }
}

#[test]
fn a_wrong_challenge_echo_fails_the_handshake() {
    let mut icc = Icc::new(Box::new(WrongEchoTransport));
    let result = bac::establish_from_values(
        &mut icc,
        &K_SEED,
        &AppendixDTransport::RND_IC,
        &RND_IFD,
        &K_IFD,
    );
    assert!(matches!(result, Err(bac::BacError::ChallengeMismatch)));
    assert!(!icc.has_secure_channel());
}
