//! The byte-level seam to the contactless card.
//!
//! The core never talks to reader hardware itself; a platform adapter
//! implements [`CardTransport`] and the rest of the stack is written against
//! it.

use std::fmt;


/// Failure reported by the platform transport.
///
/// The core does not interpret transport failures beyond two conventions
/// shared with the platform adapters: a wait that ran out carries the
/// substring `timeout`, and a card leaving the field carries `tag was lost`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransportError {
    message: String,
}
impl TransportError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.message.contains("timeout")
    }

    pub fn is_tag_lost(&self) -> bool {
        self.message.contains("tag was lost")
    }
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}
impl std::error::Error for TransportError {
}


/// A connection to a contactless card.
///
/// Implementations are expected to hold whatever platform handle is needed
/// (a PC/SC card, an NFC tag session) and to block in [`transceive`] until
/// the card answers or the platform gives up.
///
/// [`transceive`]: CardTransport::transceive
pub trait CardTransport {
    fn connect(&mut self, alert_message: Option<&str>) -> Result<(), TransportError>;

    fn disconnect(
        &mut self,
        alert_message: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Round-trips one APDU: sends the request bytes and returns the card's
    /// complete response, status word included.
    fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Cosmetic hook for platforms that render a reader dialog; ignored
    /// elsewhere.
    fn set_alert_message(&mut self, _message: &str) {}
}
