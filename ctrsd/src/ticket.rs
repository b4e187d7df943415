use std::io::Write;

use crate::signature::{self, Signature};
use crate::string::SizedCString;
use crate::{Error, Layout, Result};

use log::error;
use static_assertions::assert_eq_size;

/// Ticket data following the signature envelope.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct TicketBody {
    pub issuer: SizedCString<0x40>,
    pub ecc_public_key: [u8; 0x3C],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    pub title_key: [u8; 0x10],
    _pad0: [u8; 1],
    ticket_id: [u8; 8],
    console_id: [u8; 4],
    title_id: [u8; 8],
    _pad1: [u8; 2],
    ticket_title_version: [u8; 2],
    _pad2: [u8; 8],
    pub license_type: u8,
    pub common_key_index: u8,
    _pad3: [u8; 0x2A],
    eshop_account_id: [u8; 4],
    _pad4: [u8; 1],
    pub audit: u8,
    _pad5: [u8; 0x42],
    pub limits: [u8; 0x40],
    pub content_index_head: [u8; 0xAC],
}
assert_eq_size!([u8; 0x210], TicketBody);
unsafe impl Layout for TicketBody {}

impl TicketBody {
    #[must_use]
    pub fn title_id(&self) -> u64 {
        u64::from_be_bytes(self.title_id)
    }
    pub fn set_title_id(&mut self, title_id: u64) {
        self.title_id = title_id.to_be_bytes();
    }
    #[must_use]
    pub fn console_id(&self) -> u32 {
        u32::from_be_bytes(self.console_id)
    }
}

#[derive(Clone)]
pub struct Ticket {
    pub signature: Signature,
    pub body: TicketBody,
    pub content_index: Vec<u8>,
}

// sanity limit for the variable content index
const CONTENT_INDEX_MAX_SIZE: usize = 0x10000;

impl Ticket {
    pub fn load(file_data: &[u8], offset: usize) -> Result<Self> {
        let signature = Signature::load(file_data, offset)?;
        let body = TicketBody::read_from(file_data, offset + signature.size())?;

        // The content index carries its own size a word into its header.
        let content_index_offset =
            offset + signature.size() + core::mem::size_of::<TicketBody>();
        let size_bytes: [u8; 4] = file_data
            .get(content_index_offset + 4..content_index_offset + 8)
            .ok_or(Error::OutOfRange)?
            .try_into()
            .unwrap();
        let content_index_size = u32::from_be_bytes(size_bytes) as usize;
        if content_index_size > CONTENT_INDEX_MAX_SIZE {
            error!("Content index size too big");
            return Err(Error::OutOfRange);
        }

        let content_index = file_data
            .get(content_index_offset..content_index_offset + content_index_size)
            .ok_or(Error::OutOfRange)?
            .to_vec();

        Ok(Self {
            signature,
            body,
            content_index,
        })
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.signature.save(writer)?;
        writer.write_all(self.body.as_bytes())?;
        writer.write_all(&self.content_index)?;
        Ok(())
    }

    /// Verifies the signature over body and content index against the
    /// issuer's certificate.
    pub fn validate_signature(&self) -> Result<()> {
        let issuer = self.body.issuer.zero_terminated();
        self.signature.verify(&issuer, |hasher| {
            use sha2::Digest;
            hasher.update(self.body.as_bytes());
            hasher.update(&self.content_index);
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.signature.size() + core::mem::size_of::<TicketBody>() + self.content_index.len()
    }
}

const TICKET_ISSUER: &str = "Root-CA00000003-XS0000000c";

// Fixed content index preamble used by fake tickets.
const TICKET_CONTENT_INDEX: [u8; 44] = [
    0x00, 0x01, 0x00, 0x14, 0x00, 0x00, 0x00, 0xAC, 0x00, 0x00, 0x00, 0x14, 0x00, 0x01, 0x00,
    0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
    0x00, 0x84, 0x00, 0x00, 0x00, 0x84, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Synthesizes the generic ticket used for rebuilt archives: retail XS
/// issuer, version 1, audit 1, all-FF placeholder keys and signature.
#[must_use]
pub fn build_fake_ticket(title_id: u64) -> Ticket {
    let mut body = TicketBody::zeroed();
    body.issuer = SizedCString::from_str_padded(TICKET_ISSUER);
    body.ecc_public_key = [0xFF; 0x3C];
    body.version = 0x01;
    body.title_key = [0xFF; 0x10];
    body.set_title_id(title_id);
    body.common_key_index = 0x00;
    body.audit = 0x01;

    let mut content_index = vec![0xFFu8; TICKET_CONTENT_INDEX.len() + 0x80];
    content_index[..TICKET_CONTENT_INDEX.len()].copy_from_slice(&TICKET_CONTENT_INDEX);

    Ticket {
        signature: Signature {
            sig_type: signature::RSA2048_SHA256,
            data: vec![0xFF; 0x100],
        },
        body,
        content_index,
    }
}
