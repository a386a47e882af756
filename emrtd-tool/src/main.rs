use std::ffi::CString;

use clap::Parser;
use emrtd::bac::BacKey;
use emrtd::passport::{DataGroup, Passport};
use emrtd::transport::{CardTransport, TransportError};
use tracing::warn;


#[derive(Clone, Debug, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
enum Mode {
    /// List the connected PC/SC readers.
    ListReaders,

    /// Read a passport through the given reader.
    Read(ReadOpts),
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct ReadOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    /// Document number from the MRZ (second line).
    #[arg(short, long)]
    pub document_number: String,

    /// Date of birth from the MRZ, YYMMDD.
    #[arg(short, long)]
    pub birth_date: String,

    /// Date of expiry from the MRZ, YYMMDD.
    #[arg(short, long)]
    pub expiry_date: String,
}


/// The PC/SC adapter for the library's transport seam.
struct PcscTransport {
    context: pcsc::Context,
    reader: CString,
    card: Option<pcsc::Card>,
}
impl PcscTransport {
    fn new(context: pcsc::Context, reader: CString) -> Self {
        Self {
            context,
            reader,
            card: None,
        }
    }
}
impl CardTransport for PcscTransport {
    fn connect(&mut self, _alert_message: Option<&str>) -> Result<(), TransportError> {
        let card = self
            .context
            .connect(&self.reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
            .map_err(|e| TransportError::new(format!("failed to connect to card: {}", e)))?;
        self.card = Some(card);
        Ok(())
    }

    fn disconnect(
        &mut self,
        _alert_message: Option<&str>,
        _error_message: Option<&str>,
    ) -> Result<(), TransportError> {
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(pcsc::Disposition::LeaveCard);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.card.is_some()
    }

    fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| TransportError::new("not connected"))?;
        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let received = card
            .transmit(request, &mut buffer)
            .map_err(|e| match e {
                pcsc::Error::RemovedCard => TransportError::new("tag was lost"),
                pcsc::Error::Timeout => TransportError::new("timeout waiting for the card"),
                other => TransportError::new(format!("transmit failed: {}", other)),
            })?;
        Ok(received.to_vec())
    }
}


fn hexdump(buf: &[u8]) {
    let mut offset = 0;
    while offset < buf.len() {
        print!("{:08X}  ", offset);

        for i in 0..16 {
            if offset + i < buf.len() {
                print!(" {:02X}", buf[offset + i]);
            } else {
                print!("   ");
            }
        }

        print!(" |");
        for i in 0..16 {
            if offset + i >= buf.len() {
                break;
            }

            let b = buf[offset + i];
            if b >= b' ' && b <= b'~' {
                print!("{}", char::from(b));
            } else {
                print!(".");
            }
        }
        println!("|");

        offset += 16;
    }
}


fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mode = Mode::parse();

    let ctx = pcsc::Context::establish(pcsc::Scope::User)
        .expect("failed to establish PC/SC user context");

    let readers_buf_len = ctx.list_readers_len()
        .expect("failed to obtain length of buffer for PC/SC reader list");
    let mut readers_buf = vec![0u8; readers_buf_len];
    let mut readers = ctx.list_readers(&mut readers_buf)
        .expect("failed to list PC/SC readers");

    let opts = match mode {
        Mode::ListReaders => {
            for (i, reader) in readers.enumerate() {
                println!("{}: {:?}", i, reader);
            }
            return;
        },
        Mode::Read(opts) => opts,
    };

    let Some(reader) = readers.nth(opts.reader_index) else {
        panic!("no reader at index {}", opts.reader_index)
    };

    let key = BacKey::new(&opts.document_number, &opts.birth_date, &opts.expiry_date)
        .expect("invalid MRZ key data");

    let transport = PcscTransport::new(ctx.clone(), reader.to_owned());
    let mut passport = Passport::new(Box::new(transport));
    passport.connect(Some("Hold the passport against the reader"))
        .expect("failed to connect to card");

    // EF.CardAccess is free to read before any session; absent on
    // BAC-only documents
    match passport.read_ef_card_access() {
        Ok(card_access) => {
            println!("EF.CardAccess:");
            hexdump(&card_access);
        },
        Err(e) => warn!("EF.CardAccess not readable: {}", e),
    }

    passport.start_session(&key)
        .expect("failed to establish BAC session");

    let com = passport.read_ef_com()
        .expect("failed to read EF.COM");
    println!("EF.COM:");
    hexdump(&com);

    let dg1 = passport.read_data_group(DataGroup::Dg1)
        .expect("failed to read EF.DG1");
    println!("EF.DG1:");
    hexdump(&dg1);

    let dg2 = passport.read_data_group(DataGroup::Dg2)
        .expect("failed to read EF.DG2");
    println!("EF.DG2:");
    hexdump(&dg2);

    let sod = passport.read_ef_sod()
        .expect("failed to read EF.SOD");
    println!("EF.SOD:");
    hexdump(&sod);

    passport.disconnect(None, None)
        .expect("failed to disconnect");
}
