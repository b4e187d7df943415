use std::io::Write;

use crate::crypto::AesKey;
use crate::signature::Signature;
use crate::string::SizedCString;
use crate::{align_up, Error, Layout, Result};

use log::error;
use sha2::{Digest, Sha256};
use static_assertions::assert_eq_size;

pub mod content_type_flag {
    pub const ENCRYPTED: u16 = 1 << 0;
    pub const DISC: u16 = 1 << 2;
    pub const CFM: u16 = 1 << 3;
    pub const OPTIONAL: u16 = 1 << 14;
    pub const SHARED: u16 = 1 << 15;
}

/// Well-known content indices.
pub mod content_index {
    pub const MAIN: u16 = 0;
    pub const MANUAL: u16 = 1;
    pub const DLP: u16 = 2;
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ContentChunk {
    id: [u8; 4],
    index: [u8; 2],
    content_type: [u8; 2],
    size: [u8; 8],
    hash: [u8; 0x20],
}
assert_eq_size!([u8; 0x30], ContentChunk);
unsafe impl Layout for ContentChunk {}

impl ContentChunk {
    #[must_use]
    pub fn new(id: u32, index: u16, content_type: u16, size: u64) -> Self {
        Self {
            id: id.to_be_bytes(),
            index: index.to_be_bytes(),
            content_type: content_type.to_be_bytes(),
            size: size.to_be_bytes(),
            hash: [0; 0x20],
        }
    }
    #[must_use]
    pub fn id(&self) -> u32 {
        u32::from_be_bytes(self.id)
    }
    #[must_use]
    pub fn index(&self) -> u16 {
        u16::from_be_bytes(self.index)
    }
    /// Raw big-endian index bytes, used for building content IVs.
    #[must_use]
    pub fn index_bytes(&self) -> [u8; 2] {
        self.index
    }
    #[must_use]
    pub fn content_type(&self) -> u16 {
        u16::from_be_bytes(self.content_type)
    }
    pub fn set_content_type(&mut self, content_type: u16) {
        self.content_type = content_type.to_be_bytes();
    }
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from_be_bytes(self.size)
    }
    #[must_use]
    pub fn hash(&self) -> &[u8; 0x20] {
        &self.hash
    }
    pub fn set_hash(&mut self, hash: [u8; 0x20]) {
        self.hash = hash;
    }
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.content_type() & content_type_flag::ENCRYPTED != 0
    }
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.content_type() & content_type_flag::OPTIONAL != 0
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ContentInfo {
    index: [u8; 2],
    command_count: [u8; 2],
    hash: [u8; 0x20],
}
assert_eq_size!([u8; 0x24], ContentInfo);
unsafe impl Layout for ContentInfo {}

impl ContentInfo {
    #[must_use]
    pub fn index(&self) -> u16 {
        u16::from_be_bytes(self.index)
    }
    #[must_use]
    pub fn command_count(&self) -> u16 {
        u16::from_be_bytes(self.command_count)
    }
    fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct TmdBody {
    pub issuer: SizedCString<0x40>,
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    _reserved0: u8,
    system_version: [u8; 8],
    title_id: [u8; 8],
    title_type: [u8; 4],
    group_id: [u8; 2],
    savedata_size: [u8; 4],
    srl_private_savedata_size: [u8; 4],
    _reserved1: [u8; 4],
    pub srl_flag: u8,
    _reserved2: [u8; 0x31],
    access_rights: [u8; 4],
    title_version: [u8; 2],
    content_count: [u8; 2],
    boot_content: [u8; 2],
    _reserved3: [u8; 2],
    contentinfo_hash: [u8; 0x20],
    pub contentinfo: [ContentInfo; 64],
}
assert_eq_size!([u8; 0x9C4], TmdBody);
unsafe impl Layout for TmdBody {}

impl TmdBody {
    #[must_use]
    pub fn title_id(&self) -> u64 {
        u64::from_be_bytes(self.title_id)
    }
    pub fn set_title_id(&mut self, title_id: u64) {
        self.title_id = title_id.to_be_bytes();
    }
    #[must_use]
    pub fn title_version(&self) -> u16 {
        u16::from_be_bytes(self.title_version)
    }
    #[must_use]
    pub fn content_count(&self) -> u16 {
        u16::from_be_bytes(self.content_count)
    }
    pub fn set_content_count(&mut self, count: u16) {
        self.content_count = count.to_be_bytes();
    }
    #[must_use]
    pub fn boot_content(&self) -> u16 {
        u16::from_be_bytes(self.boot_content)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_contentinfo_hash_for_tests(&mut self) {
        self.contentinfo_hash[0] ^= 0x01;
    }
}

/// Title metadata: signed record describing the content set of a title.
#[derive(Clone)]
pub struct TitleMetadata {
    pub signature: Signature,
    pub body: TmdBody,
    pub chunks: Vec<ContentChunk>,
}

impl TitleMetadata {
    pub fn load(file_data: &[u8], offset: usize) -> Result<Self> {
        let signature = Signature::load(file_data, offset)?;

        // The body is aligned to the nearest 0x40 after the signature.
        let body_start = align_up(signature.data.len() + 4, 0x40);
        let body = TmdBody::read_from(file_data, offset + body_start)?;
        let body_end = body_start + core::mem::size_of::<TmdBody>();

        let content_count = body.content_count() as usize;
        let expected_size = body_end + content_count * core::mem::size_of::<ContentChunk>();
        if file_data.len() < offset + expected_size {
            error!(
                "Malformed TMD, expected size {:#x}, got {:#x}",
                expected_size,
                file_data.len() - offset
            );
            return Err(Error::OutOfRange);
        }

        let chunks = crate::read_table(file_data, offset + body_end, content_count)?;
        Ok(Self {
            signature,
            body,
            chunks,
        })
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.signature.save(writer)?;
        writer.write_all(self.body.as_bytes())?;
        for chunk in &self.chunks {
            writer.write_all(chunk.as_bytes())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.signature.size()
            + core::mem::size_of::<TmdBody>()
            + self.chunks.len() * core::mem::size_of::<ContentChunk>()
    }

    #[must_use]
    pub fn title_id(&self) -> u64 {
        self.body.title_id()
    }

    #[must_use]
    pub fn title_version(&self) -> u16 {
        self.body.title_version()
    }

    /// "maj.min.micro" rendering of the title version.
    #[must_use]
    pub fn title_version_string(&self) -> String {
        let version = self.body.title_version();
        format!(
            "{}.{}.{}",
            version >> 10,
            (version >> 4) & 0x3F,
            version & 0xF
        )
    }

    #[must_use]
    pub fn boot_content_id(&self) -> Option<u32> {
        self.chunks
            .get(content_index::MAIN as usize)
            .map(ContentChunk::id)
    }

    pub fn content_chunk_by_id(&self, id: u32) -> Option<&ContentChunk> {
        self.chunks.iter().find(|chunk| chunk.id() == id)
    }

    pub fn content_chunk_by_id_mut(&mut self, id: u32) -> Option<&mut ContentChunk> {
        self.chunks.iter_mut().find(|chunk| chunk.id() == id)
    }

    #[must_use]
    pub fn has_content_id(&self, id: u32) -> bool {
        self.content_chunk_by_id(id).is_some()
    }

    /// CIA/CDN content IV: the 16-bit content index in the high bytes.
    #[must_use]
    pub fn content_iv_by_index(&self, index: usize) -> AesKey {
        let mut iv = [0u8; 0x10];
        if let Some(chunk) = self.chunks.get(index) {
            iv[..2].copy_from_slice(&chunk.index_bytes());
        }
        iv
    }

    fn chunk_range_digest(&self, info: &ContentInfo) -> Result<[u8; 0x20]> {
        let start = info.index() as usize;
        let end = start
            .checked_add(info.command_count() as usize)
            .ok_or(Error::OutOfRange)?;
        let chunks = self.chunks.get(start..end).ok_or(Error::OutOfRange)?;

        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk.as_bytes());
        }
        Ok(hasher.finalize().into())
    }

    fn info_array_digest(&self) -> [u8; 0x20] {
        // The hash covers the contiguous non-zero prefix of the info array.
        let mut hasher = Sha256::new();
        for info in &self.body.contentinfo {
            if info.is_zero() {
                break;
            }
            hasher.update(info.as_bytes());
        }
        hasher.finalize().into()
    }

    /// Checks every content-info hash and the info-array hash in the body.
    pub fn verify_hashes(&self) -> Result<()> {
        for info in &self.body.contentinfo {
            if info.is_zero() {
                continue;
            }
            if self.chunk_range_digest(info)? != info.hash {
                error!("Content info hash mismatch");
                return Err(Error::HashMismatch);
            }
        }
        if self.info_array_digest() != self.body.contentinfo_hash {
            error!("Content info array hash mismatch");
            return Err(Error::HashMismatch);
        }
        Ok(())
    }

    /// Recomputes all hashes `verify_hashes` checks.
    pub fn fix_hashes(&mut self) -> Result<()> {
        for i in 0..self.body.contentinfo.len() {
            let info = self.body.contentinfo[i];
            if info.is_zero() {
                continue;
            }
            self.body.contentinfo[i].hash = self.chunk_range_digest(&info)?;
        }
        self.body.contentinfo_hash = self.info_array_digest();
        Ok(())
    }

    /// Verifies the signature over the body against the issuer certificate.
    pub fn validate_signature(&self) -> Result<()> {
        let issuer = self.body.issuer.zero_terminated();
        self.signature.verify(&issuer, |hasher| {
            hasher.update(self.body.as_bytes());
        })
    }

    /// Builds a metadata record from scratch, for tests and rebuilt titles.
    #[must_use]
    pub fn from_chunks(title_id: u64, chunks: Vec<ContentChunk>) -> Self {
        let mut body = TmdBody::zeroed();
        body.set_title_id(title_id);
        body.set_content_count(chunks.len() as u16);
        body.contentinfo[0] = ContentInfo {
            index: 0u16.to_be_bytes(),
            command_count: (chunks.len() as u16).to_be_bytes(),
            hash: [0; 0x20],
        };
        let mut tmd = Self {
            signature: Signature {
                sig_type: crate::signature::RSA2048_SHA256,
                data: vec![0u8; 0x100],
            },
            body,
            chunks,
        };
        // Ignore errors: the chunk vector always matches the info entry here.
        let _ = tmd.fix_hashes();
        tmd
    }
}
