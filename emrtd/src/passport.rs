//! Typed per-file read operations over a single card session.
//!
//! One method per elementary file, each returning the raw TLV-framed bytes;
//! parsing the contents into MRZ text, images or certificates is someone
//! else's job. The facade also owns the one piece of protocol state the
//! lower layers do not track: which DF is currently selected.

use std::fmt;

use crate::bac::{BacError, BacKey};
use crate::icc::IccError;
use crate::iso7816::status::StatusWord;
use crate::mrtd::{Mrtd, ReadError};
use crate::transport::{CardTransport, TransportError};


/// File identifier of EF.COM under the eMRTD application.
pub const FID_EF_COM: u16 = 0x011E;
/// File identifier of EF.SOD under the eMRTD application.
pub const FID_EF_SOD: u16 = 0x011D;
/// File identifier of EF.CardAccess under the Master File.
pub const FID_EF_CARD_ACCESS: u16 = 0x011C;
/// Short file identifier of EF.CardAccess.
pub const SFI_EF_CARD_ACCESS: u8 = 0x1C;
/// Short file identifier of EF.CardSecurity.
pub const SFI_EF_CARD_SECURITY: u8 = 0x1D;


/// The sixteen standardised Data Groups.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DataGroup {
    Dg1 = 1,
    Dg2 = 2,
    Dg3 = 3,
    Dg4 = 4,
    Dg5 = 5,
    Dg6 = 6,
    Dg7 = 7,
    Dg8 = 8,
    Dg9 = 9,
    Dg10 = 10,
    Dg11 = 11,
    Dg12 = 12,
    Dg13 = 13,
    Dg14 = 14,
    Dg15 = 15,
    Dg16 = 16,
}
impl DataGroup {
    pub const fn number(self) -> u8 {
        self as u8
    }

    pub const fn file_id(self) -> u16 {
        0x0100 + self.number() as u16
    }

    pub const fn short_file_id(self) -> u8 {
        self.number()
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum SelectedDf {
    None,
    Emrtd,
    MasterFile,
}


/// The one error type the facade reports: a rendered message plus, when the
/// failure came from the card, the status word that caused it.
#[derive(Debug)]
pub struct PassportError {
    message: String,
    status: Option<StatusWord>,
}
impl PassportError {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<StatusWord> {
        self.status
    }

    /// Some cards answer `0x63CF` where the standard calls for `0x6982`.
    fn remap(status: StatusWord) -> StatusWord {
        if status.to_word() == 0x63CF {
            StatusWord::SecurityStatusNotSatisfied
        } else {
            status
        }
    }

    fn from_icc(value: &IccError) -> Option<StatusWord> {
        match value {
            IccError::Command { status, .. } => Some(Self::remap(*status)),
            _ => None,
        }
    }
}
impl fmt::Display for PassportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} [status {}]", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}
impl std::error::Error for PassportError {
}
impl From<ReadError> for PassportError {
    fn from(value: ReadError) -> Self {
        let status = match &value {
            ReadError::Icc(e) => Self::from_icc(e),
            ReadError::Bac(BacError::Icc(e)) => Self::from_icc(e),
            _ => None,
        };
        Self { message: value.to_string(), status }
    }
}
impl From<BacError> for PassportError {
    fn from(value: BacError) -> Self {
        let status = match &value {
            BacError::Icc(e) => Self::from_icc(e),
            _ => None,
        };
        Self { message: value.to_string(), status }
    }
}
impl From<IccError> for PassportError {
    fn from(value: IccError) -> Self {
        let status = Self::from_icc(&value);
        Self { message: value.to_string(), status }
    }
}
impl From<TransportError> for PassportError {
    fn from(value: TransportError) -> Self {
        Self { message: value.to_string(), status: None }
    }
}


/// A passport over some transport.
///
/// Strictly sequential: one `Passport` owns one card, one channel, one
/// session. Callers that want concurrency must serialise.
pub struct Passport {
    mrtd: Mrtd,
    selected_df: SelectedDf,
}
impl Passport {
    pub fn new(transport: Box<dyn CardTransport>) -> Self {
        Self {
            mrtd: Mrtd::new(transport),
            selected_df: SelectedDf::None,
        }
    }

    pub fn connect(&mut self, alert_message: Option<&str>) -> Result<(), PassportError> {
        self.mrtd.icc_mut().transport_mut().connect(alert_message)?;
        self.mrtd.icc_mut().clear_secure_channel();
        self.selected_df = SelectedDf::None;
        Ok(())
    }

    pub fn disconnect(
        &mut self,
        alert_message: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), PassportError> {
        self.mrtd.icc_mut().clear_secure_channel();
        self.selected_df = SelectedDf::None;
        self.mrtd
            .icc_mut()
            .transport_mut()
            .disconnect(alert_message, error_message)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.mrtd.icc().transport().is_connected()
    }

    pub fn set_alert_message(&mut self, message: &str) {
        self.mrtd.icc_mut().transport_mut().set_alert_message(message);
    }

    /// Establish Secure Messaging via BAC. The selected DF is unchanged.
    pub fn start_session(&mut self, key: &BacKey) -> Result<(), PassportError> {
        self.mrtd.init_session_via_bac(key)?;
        Ok(())
    }

    pub fn select_emrtd_application(&mut self) -> Result<(), PassportError> {
        self.mrtd.select_emrtd_application()?;
        self.selected_df = SelectedDf::Emrtd;
        Ok(())
    }

    pub fn select_master_file(&mut self) -> Result<(), PassportError> {
        self.mrtd.select_master_file()?;
        self.selected_df = SelectedDf::MasterFile;
        Ok(())
    }

    fn ensure_emrtd_application(&mut self) -> Result<(), PassportError> {
        if self.selected_df != SelectedDf::Emrtd {
            self.select_emrtd_application()?;
        }
        Ok(())
    }

    pub fn read_ef_com(&mut self) -> Result<Vec<u8>, PassportError> {
        self.ensure_emrtd_application()?;
        Ok(self.mrtd.read_file(FID_EF_COM)?)
    }

    pub fn read_ef_sod(&mut self) -> Result<Vec<u8>, PassportError> {
        self.ensure_emrtd_application()?;
        Ok(self.mrtd.read_file(FID_EF_SOD)?)
    }

    pub fn read_data_group(&mut self, data_group: DataGroup) -> Result<Vec<u8>, PassportError> {
        self.ensure_emrtd_application()?;
        Ok(self.mrtd.read_file(data_group.file_id())?)
    }

    /// EF.CardAccess lives under the Master File and is addressable by SFI
    /// without any prior selection.
    pub fn read_ef_card_access(&mut self) -> Result<Vec<u8>, PassportError> {
        Ok(self.mrtd.read_file_by_sfi(SFI_EF_CARD_ACCESS)?)
    }

    /// EF.CardSecurity, likewise addressed by SFI under MF semantics.
    pub fn read_ef_card_security(&mut self) -> Result<Vec<u8>, PassportError> {
        Ok(self.mrtd.read_file_by_sfi(SFI_EF_CARD_SECURITY)?)
    }

    /// Active Authentication pass-through: INTERNAL AUTHENTICATE with the
    /// caller's challenge, returning the card's signature unexamined.
    pub fn active_authenticate(&mut self, challenge: &[u8; 8]) -> Result<Vec<u8>, PassportError> {
        self.ensure_emrtd_application()?;
        Ok(self.mrtd.icc_mut().internal_authenticate(challenge)?)
    }
}
