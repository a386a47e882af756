//! Sequenced eMRTD operations: application selection, session initiation and
//! the fault-tolerant file read loop.
//!
//! Cards disagree about how much of a file they will hand over per READ
//! BINARY. The loop starts optimistic, listens to the status words and
//! shrinks its window down a fixed schedule; a session that goes bad
//! mid-file is re-established through a registered handle and the read
//! carries on.

use std::fmt;

use tracing::{debug, instrument, warn};

use crate::bac::{self, BacError, BacKey};
use crate::icc::{FileSelection, Icc, IccError, SHORT_OFFSET_MAX};
use crate::iso7816::status::StatusWord;
use crate::tlv::{self, TlvError};
use crate::transport::CardTransport;


/// Application identifier of the eMRTD application (DF1).
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Default (and largest) read window.
pub const DEFAULT_MAX_READ: usize = 256;

/// Read windows tried, in order, when a card chokes on the current one.
/// The steps reflect chunk sizes real cards are known to cope with.
const MAX_READ_BACKOFF: [usize; 9] = [224, 160, 128, 96, 64, 32, 16, 8, 1];

/// Bytes fetched up front; enough for any EF's tag and length.
const READ_AHEAD: usize = 8;


#[derive(Debug)]
pub enum ReadError {
    Icc(IccError),
    Bac(BacError),
    FileHeader(TlvError),
    OffsetOverflow { offset: usize },
}
impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Icc(e)
                => write!(f, "{}", e),
            Self::Bac(e)
                => write!(f, "session establishment failed: {}", e),
            Self::FileHeader(e)
                => write!(f, "file does not start with a valid TLV header: {}", e),
            Self::OffsetOverflow { offset }
                => write!(f, "file offset {} exceeds the extended addressing range", offset),
        }
    }
}
impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Icc(e) => Some(e),
            Self::Bac(e) => Some(e),
            Self::FileHeader(e) => Some(e),
            Self::OffsetOverflow { .. } => None,
        }
    }
}
impl From<IccError> for ReadError {
    fn from(value: IccError) -> Self { Self::Icc(value) }
}
impl From<BacError> for ReadError {
    fn from(value: BacError) -> Self { Self::Bac(value) }
}
impl From<TlvError> for ReadError {
    fn from(value: TlvError) -> Self { Self::FileHeader(value) }
}


/// Re-establishes a Secure Messaging session after a recoverable failure.
///
/// The read loop calls this through a registered handle; it is the one
/// dynamic-dispatch point in the loop, and the seam where an establishment
/// protocol other than BAC would plug in.
pub trait SessionInit {
    fn reinit(&self, icc: &mut Icc) -> Result<(), ReadError>;
}

struct BacSessionInit {
    key: BacKey,
}
impl SessionInit for BacSessionInit {
    fn reinit(&self, icc: &mut Icc) -> Result<(), ReadError> {
        bac::establish(icc, &self.key)?;
        Ok(())
    }
}


/// The sequenced eMRTD operations over one card.
pub struct Mrtd {
    icc: Icc,
    max_read: usize,
    session_init: Option<Box<dyn SessionInit>>,
}
impl Mrtd {
    pub fn new(transport: Box<dyn CardTransport>) -> Self {
        Self {
            icc: Icc::new(transport),
            max_read: DEFAULT_MAX_READ,
            session_init: None,
        }
    }

    pub fn icc_mut(&mut self) -> &mut Icc {
        &mut self.icc
    }

    pub fn icc(&self) -> &Icc {
        &self.icc
    }

    /// The current read window. Shrinks while a file is being read and is
    /// restored to the default on fatal errors only.
    pub fn max_read(&self) -> usize {
        self.max_read
    }

    /// Establish Secure Messaging via BAC and remember how, so the read
    /// loop can re-establish the session if the card drops it mid-file.
    pub fn init_session_via_bac(&mut self, key: &BacKey) -> Result<(), ReadError> {
        bac::establish(&mut self.icc, key)?;
        self.session_init = Some(Box::new(BacSessionInit { key: key.clone() }));
        Ok(())
    }

    /// Register a custom session-establishment handle in place of BAC.
    pub fn set_session_init(&mut self, handle: Box<dyn SessionInit>) {
        self.session_init = Some(handle);
    }

    #[instrument(skip(self))]
    pub fn select_emrtd_application(&mut self) -> Result<(), ReadError> {
        self.icc.select_file(FileSelection::DfName(EMRTD_AID.to_vec()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn select_master_file(&mut self) -> Result<(), ReadError> {
        self.icc.select_file(FileSelection::MasterFile)?;
        Ok(())
    }

    /// Read a whole elementary file by its two-byte identifier.
    #[instrument(skip(self))]
    pub fn read_file(&mut self, fid: u16) -> Result<Vec<u8>, ReadError> {
        self.icc.select_file(FileSelection::ChildEf(fid))?;
        let first = self.icc.read_binary(0, READ_AHEAD)?;
        self.read_remainder(first.data)
    }

    /// Read a whole elementary file by short file identifier. The SFI read
    /// selects the file as a side effect; subsequent chunks use plain
    /// offset reads.
    #[instrument(skip(self))]
    pub fn read_file_by_sfi(&mut self, sfi: u8) -> Result<Vec<u8>, ReadError> {
        let first = self.icc.read_binary_sfi(sfi, 0, READ_AHEAD)?;
        self.read_remainder(first.data)
    }

    /// Complete a file whose first bytes (containing the TLV header) have
    /// already been read.
    fn read_remainder(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, ReadError> {
        let header = tlv::read_file_header(&data)?;
        let total = header.header_len + header.value_len;
        debug!(tag = header.tag, length = total, "reading file");

        while data.len() < total {
            let offset = data.len();
            let wanted = (total - offset).min(self.max_read);

            let result = if offset > SHORT_OFFSET_MAX {
                if offset > 0x7FFF_FFFF {
                    return Err(ReadError::OffsetOverflow { offset });
                }
                self.icc.read_binary_extended(offset, wanted)
            } else {
                // keep the window inside the short addressing range; once no
                // short read can make progress, fall over to the extended
                // variant
                let capped = wanted.min(SHORT_OFFSET_MAX - offset);
                if capped == 0 {
                    self.icc.read_binary_extended(offset, wanted)
                } else {
                    self.icc.read_binary(offset, capped)
                }
            };

            match result {
                Ok(response) => {
                    data.extend_from_slice(&response.data);
                },
                Err(IccError::Command { status, data: received }) => {
                    // partial data delivered alongside an error status is
                    // kept; the cards that send it mean it
                    match status {
                        StatusWord::EndOfFile => {
                            warn!(offset, "end of file before the declared length");
                            data.extend_from_slice(&received);
                            self.step_down_max_read();
                        },
                        StatusWord::CorruptedData => {
                            warn!(offset, "card warns returned data may be corrupted");
                            data.extend_from_slice(&received);
                        },
                        StatusWord::WrongLength => {
                            self.step_down_max_read();
                            warn!(max_read = self.max_read, "wrong length; shrinking the read window");
                        },
                        StatusWord::WrongLengthExact(exact) => {
                            self.max_read = if exact == 0 { 256 } else { exact.into() };
                            warn!(max_read = self.max_read, "card dictated an exact read length");
                        },
                        _ if !received.is_empty() => {
                            data.extend_from_slice(&received);
                            match self.session_init.as_deref() {
                                Some(handle) => {
                                    warn!(status = %status, "read failed mid-file; re-establishing the session");
                                    handle.reinit(&mut self.icc)?;
                                },
                                None => {
                                    self.max_read = DEFAULT_MAX_READ;
                                    return Err(ReadError::Icc(IccError::Command { status, data: received }));
                                },
                            }
                        },
                        _ => {
                            self.max_read = DEFAULT_MAX_READ;
                            return Err(ReadError::Icc(IccError::Command { status, data: received }));
                        },
                    }
                },
                Err(other) => {
                    self.max_read = DEFAULT_MAX_READ;
                    return Err(other.into());
                },
            }
        }

        // a card may over-deliver past the declared length; the file ends
        // where the TLV says it does
        if data.len() > total {
            data.truncate(total);
        }
        debug!(tag = header.tag, length = data.len(), "file read complete");
        Ok(data)
    }

    fn step_down_max_read(&mut self) {
        if let Some(&next) = MAX_READ_BACKOFF.iter().find(|&&step| step < self.max_read) {
            self.max_read = next;
        }
    }
}
