use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::cert;
use crate::copier::{FileCopier, ProgressCallback, ProgressWrapper};
use crate::crypto::{self, AesKey, CryptoTransform};
use crate::key::{self, slot};
use crate::ncch::{NcchAbortHandle, NcchContainer};
use crate::sdmc::title_key_iv;
use crate::ticket::{build_fake_ticket, Ticket};
use crate::titledb::TicketDb;
use crate::titlekeys::TitleKeysMap;
use crate::tmd::{content_index, content_type_flag, TitleMetadata};
use crate::{align_up, Error, Layout, Result};

use log::{error, warn};
use sha2::{Digest, Sha256};
use static_assertions::assert_eq_size;

pub const CIA_CONTENT_MAX_COUNT: usize = 0x10000;
pub const CIA_CONTENT_BITS_SIZE: usize = CIA_CONTENT_MAX_COUNT / 8;
pub const CIA_HEADER_SIZE: usize = 0x2020;
pub const CIA_CERT_SIZE: usize = 0xA00;
pub const CIA_METADATA_SIZE: usize = 0x3AC0;

const CIA_ALIGNMENT: usize = 0x40;

/// High title-ID word of add-on content, which never carries a meta section.
const DLC_TID_HIGH: u64 = 0x0004_008C;

/// Selects the cryptographic treatment of one build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Decrypted contents with a generalized ticket.
    Standard,
    /// Original encryption and verified TMD, but a generalized ticket.
    PirateLegit,
    /// Fully legit: original encryption and the console-bound ticket.
    Legit,
}

impl BuildMode {
    #[must_use]
    pub fn file_extension(self) -> &'static str {
        match self {
            Self::Standard => "standard.cia",
            Self::PirateLegit => "piratelegit.cia",
            Self::Legit => "legit.cia",
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CiaHeader {
    pub header_size: u32,
    pub ty: u16,
    pub version: u16,
    pub cert_size: u32,
    pub tik_size: u32,
    pub tmd_size: u32,
    pub meta_size: u32,
    pub content_size: u64,
    pub content_present: [u8; CIA_CONTENT_BITS_SIZE],
}
assert_eq_size!([u8; CIA_HEADER_SIZE], CiaHeader);
unsafe impl Layout for CiaHeader {}

impl CiaHeader {
    /// The content_present bit array defines which TMD contents are in the
    /// CIA; index 0 is the MSB of byte 0.
    #[must_use]
    pub fn is_content_present(&self, index: u16) -> bool {
        self.content_present[(index >> 3) as usize] & (0x80 >> (index & 7)) != 0
    }

    pub fn set_content_present(&mut self, index: u16) {
        self.content_present[(index >> 3) as usize] |= 0x80 >> (index & 7);
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CiaMetadata {
    pub dependencies: [u8; 0x180],
    _reserved0: [u8; 0x180],
    pub core_version: u32,
    _reserved1: [u8; 0xFC],
    pub icon_data: [u8; 0x36C0],
}
assert_eq_size!([u8; CIA_METADATA_SIZE], CiaMetadata);
unsafe impl Layout for CiaMetadata {}

/// File sink that can hash exactly the bytes written through it while
/// enabled.
struct HashedWriter<W> {
    inner: W,
    sha: Sha256,
    hash_enabled: bool,
}

impl<W: Write + Seek> HashedWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            sha: Sha256::new(),
            hash_enabled: false,
        }
    }

    fn set_hash_enabled(&mut self, enabled: bool) {
        self.hash_enabled = enabled;
        if enabled {
            // Restart when hashing is newly enabled
            self.sha = Sha256::new();
        }
    }

    fn take_hash(&mut self) -> [u8; 0x20] {
        self.sha.finalize_reset().into()
    }

    fn verify_hash(&mut self, expected: &[u8; 0x20]) -> bool {
        self.take_hash() == *expected
    }
}

impl<W: Write> Write for HashedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        if self.hash_enabled {
            self.sha.update(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for HashedWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Composes an installable archive out of certificates, a ticket, title
/// metadata and content payloads. One builder handles one build at a time:
/// `init` -> `add_content`* -> `finalize`, with `abort` usable from another
/// thread during `add_content`.
pub struct CiaBuilder {
    // Persistent state
    ticket_db: Option<Arc<TicketDb>>,
    enc_title_keys: Option<TitleKeysMap>,

    // State of a single build
    mode: BuildMode,
    header: CiaHeader,
    meta: CiaMetadata,
    tmd: TitleMetadata,
    title_key: AesKey,

    cert_offset: u64,
    ticket_offset: u64,
    tmd_offset: u64,
    content_offset: u64,

    file: Option<HashedWriter<fs::File>>,
    /// size written, with alignment
    written: u64,
    total_size: u64,
    wrapper: ProgressWrapper,

    // The in-flight NCCH decryptor to cancel on abort
    abort_ncch: Mutex<Option<NcchAbortHandle>>,
    copier: FileCopier,
}

impl CiaBuilder {
    #[must_use]
    pub fn new(ticket_db: Option<Arc<TicketDb>>, enc_title_keys: Option<TitleKeysMap>) -> Self {
        Self {
            ticket_db,
            enc_title_keys,
            mode: BuildMode::Standard,
            header: CiaHeader::zeroed(),
            meta: CiaMetadata::zeroed(),
            tmd: TitleMetadata::from_chunks(0, Vec::new()),
            title_key: [0; 0x10],
            cert_offset: 0,
            ticket_offset: 0,
            tmd_offset: 0,
            content_offset: 0,
            file: None,
            written: 0,
            total_size: 0,
            wrapper: ProgressWrapper::new(0),
            abort_ncch: Mutex::new(None),
            copier: FileCopier::new(),
        }
    }

    /// Starts a build. Verification required by the mode happens before the
    /// output file is created, so a rejected TMD leaves the path untouched.
    pub fn init(
        &mut self,
        mode: BuildMode,
        destination: &Path,
        tmd: TitleMetadata,
        total_size: u64,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        self.mode = mode;
        self.header = CiaHeader::zeroed();
        self.meta = CiaMetadata::zeroed();
        self.tmd = tmd;

        if mode == BuildMode::Standard {
            // Contents will be written decrypted
            for chunk in &mut self.tmd.chunks {
                chunk.set_content_type(chunk.content_type() & !content_type_flag::ENCRYPTED);
            }
        }
        if mode == BuildMode::Legit || mode == BuildMode::PirateLegit {
            if self.tmd.verify_hashes().is_err() || self.tmd.validate_signature().is_err() {
                error!("TMD is not legit");
                return Err(Error::SignatureCorrupted);
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Could not create {}", parent.display());
                Error::from(e)
            })?;
        }
        self.file = Some(HashedWriter::new(fs::File::create(destination).map_err(
            |e| {
                error!("Could not open file {}", destination.display());
                Error::from(e)
            },
        )?));

        self.header.header_size = CIA_HEADER_SIZE as u32;
        // Header itself is written in finalize

        self.cert_offset = align_up(CIA_HEADER_SIZE, CIA_ALIGNMENT) as u64;
        self.header.cert_size = CIA_CERT_SIZE as u32;
        self.write_cert().map_err(|e| {
            error!("Could not write cert to file {}", destination.display());
            e
        })?;

        self.ticket_offset =
            align_up(self.cert_offset as usize + CIA_CERT_SIZE, CIA_ALIGNMENT) as u64;
        self.write_ticket()?;

        // TMD is written in finalize, once content hashes are known
        self.tmd_offset = align_up(
            self.ticket_offset as usize + self.header.tik_size as usize,
            CIA_ALIGNMENT,
        ) as u64;
        self.header.tmd_size = self.tmd.size() as u32;

        self.content_offset = align_up(
            self.tmd_offset as usize + self.header.tmd_size as usize,
            CIA_ALIGNMENT,
        ) as u64;
        self.header.content_size = 0;
        self.header.meta_size = 0;

        self.written = self.content_offset;
        self.total_size = total_size;
        self.wrapper = ProgressWrapper::new(total_size);
        self.wrapper.set_current(self.written);

        callback(self.written, total_size);
        Ok(())
    }

    /// Releases the output file handle.
    pub fn cleanup(&mut self) {
        self.file = None;
    }

    fn write_cert(&mut self) -> Result<()> {
        if !cert::is_loaded() {
            return Err(Error::MissingRegion);
        }

        let file = self.file.as_mut().ok_or(Error::MissingRegion)?;
        file.seek(SeekFrom::Start(self.cert_offset))?;
        for name in cert::CIA_CERT_NAMES {
            let cert = cert::get(name).ok_or(Error::MissingRegion)?;
            cert.save(file).map_err(|e| {
                error!("Failed to write cert {name}");
                e
            })?;
        }
        Ok(())
    }

    fn find_legit_ticket(&self, title_id: u64) -> Result<Ticket> {
        if let Some(ticket) = self
            .ticket_db
            .as_ref()
            .and_then(|db| db.tickets.get(&title_id))
        {
            if ticket.validate_signature().is_err() {
                error!("Ticket in ticket.db for {title_id:016x} is not legit");
                return Err(Error::SignatureCorrupted);
            }
            return Ok(ticket.clone());
        }

        error!("Ticket for {title_id:016x} does not exist in ticket.db");
        Err(Error::MissingRegion)
    }

    /// Synthesizes a ticket, copying common_key_index and title_key from
    /// either installed tickets or GM9 support files when available.
    fn build_standard_ticket(&self, title_id: u64) -> Ticket {
        let mut ticket = build_fake_ticket(title_id);

        if let Some(legit) = self
            .ticket_db
            .as_ref()
            .and_then(|db| db.tickets.get(&title_id))
        {
            ticket.body.common_key_index = legit.body.common_key_index;
            ticket.body.title_key = legit.body.title_key;
        } else if let Some(entry) = self
            .enc_title_keys
            .as_ref()
            .and_then(|map| map.get(&title_id))
        {
            ticket.body.common_key_index = entry.common_key_index() as u8;
            ticket.body.title_key = entry.title_key;
        } else {
            warn!("Could not find title key for {title_id:016x}");
        }
        ticket
    }

    fn title_key_of(ticket: &Ticket) -> AesKey {
        if key::select_common_key_index(ticket.body.common_key_index).is_err()
            || !key::is_normal_key_available(slot::TICKET_COMMON)
        {
            error!("Ticket common key is not available");
            return AesKey::default();
        }
        let common_key = match key::normal_key(slot::TICKET_COMMON) {
            Ok(key) => key,
            Err(_) => return AesKey::default(),
        };

        let iv = title_key_iv(ticket.body.title_id());
        let mut title_key = ticket.body.title_key;
        crypto::cbc_decrypt(&common_key, &iv, &mut title_key);
        title_key
    }

    fn write_ticket(&mut self) -> Result<()> {
        let title_id = self.tmd.title_id();

        let ticket = if self.mode == BuildMode::Legit {
            self.find_legit_ticket(title_id)?
        } else {
            self.build_standard_ticket(title_id)
        };
        self.title_key = Self::title_key_of(&ticket);

        self.header.tik_size = ticket.size() as u32;

        let file = self.file.as_mut().ok_or(Error::MissingRegion)?;
        file.seek(SeekFrom::Start(self.ticket_offset))?;
        ticket.save(file).map_err(|e| {
            error!("Could not write ticket");
            e
        })
    }

    /// Streams one content into the archive. For Standard builds the NCCH
    /// is decrypted through its own streamer and hashed at the sink; other
    /// modes re-encrypt the raw image with the title key, hashing the
    /// plaintext.
    pub fn add_content<F: Read + Seek + Send>(
        &mut self,
        content_id: u32,
        ncch: &mut NcchContainer<F>,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        ncch.load()?;

        let chunk = *self
            .tmd
            .content_chunk_by_id(content_id)
            .ok_or(Error::MissingRegion)?;

        let file = self.file.as_mut().ok_or(Error::MissingRegion)?;
        // To enforce alignment
        file.seek(SeekFrom::Start(self.written))?;
        self.wrapper.set_current(self.written);

        if self.mode == BuildMode::Standard {
            // Decrypt the NCCH into the sink; the sink hashes the written
            // bytes, as there is no other way to see the decrypted stream.
            file.set_hash_enabled(true);
            *self.abort_ncch.lock().unwrap() = Some(ncch.abort_handle());
            let ret = ncch.decrypt_to_file(file, &self.wrapper.wrap(callback));
            *self.abort_ncch.lock().unwrap() = None;
            ret?;

            let hash = file.take_hash();
            file.set_hash_enabled(false);
            self.tmd
                .content_chunk_by_id_mut(content_id)
                .expect("chunk existed above")
                .set_hash(hash);
        } else {
            let size = ncch.file_size()?;

            // For encrypted content the hash covers the plaintext, so it is
            // computed inside the transform; unencrypted content can use
            // the sink's hashing.
            let is_encrypted = chunk.is_encrypted();
            if is_encrypted {
                let iv = self.tmd.content_iv_by_index(chunk.index() as usize);
                self.copier
                    .set_transform(Some(CryptoTransform::cbc_encrypt_hash(&self.title_key, &iv)));
            } else {
                self.copier.set_transform(None);
                file.set_hash_enabled(true);
            }

            self.copier.reset(size);
            let source = ncch.raw_file();
            source.seek(SeekFrom::Start(0))?;
            self.copier
                .run(source, size, file, &self.wrapper.wrap(callback))?;

            let verified = if is_encrypted {
                self.copier
                    .take_transform()
                    .map(|t| t.verify_hash(chunk.hash()))
                    .unwrap_or(false)
            } else {
                let ok = file.verify_hash(chunk.hash());
                file.set_hash_enabled(false);
                ok
            };
            if !verified {
                error!("Hash mismatch for content {content_id}");
                return Err(Error::HashMismatch);
            }
        }

        let file = self.file.as_mut().ok_or(Error::MissingRegion)?;
        let position = file.seek(SeekFrom::Current(0))?;
        self.written = align_up(position as usize, CIA_ALIGNMENT) as u64;

        self.header.content_size = self.written - self.content_offset;
        self.header.set_content_present(chunk.index());

        // DLCs do not have a meta section
        if chunk.index() != content_index::MAIN || (self.tmd.title_id() >> 32) == DLC_TID_HIGH {
            return Ok(());
        }

        // Load meta off the main content
        let exheader = ncch.exheader().copied().unwrap_or_else(Layout::zeroed);
        self.meta.dependencies = exheader.dependency_bytes();
        self.meta.core_version = exheader.arm11_system_local_caps.core_version;

        match ncch.load_section_exefs("icon") {
            Ok(smdh_buffer) => {
                let len = self.meta.icon_data.len().min(smdh_buffer.len());
                self.meta.icon_data[..len].copy_from_slice(&smdh_buffer[..len]);
                self.header.meta_size = CIA_METADATA_SIZE as u32;
            }
            Err(_) => {
                warn!("Failed to load icon in ExeFS");
            }
        }
        Ok(())
    }

    /// Writes the header, the (re-hashed) TMD and the meta section.
    pub fn finalize(&mut self, callback: &ProgressCallback<'_>) -> Result<()> {
        if self.mode == BuildMode::Standard {
            self.tmd.fix_hashes()?;
        }

        let file = self.file.as_mut().ok_or(Error::MissingRegion)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(self.header.as_bytes()).map_err(|e| {
            error!("Failed to write header");
            Error::from(e)
        })?;

        file.seek(SeekFrom::Start(self.tmd_offset))?;
        self.tmd.save(file)?;

        let file = self.file.as_mut().ok_or(Error::MissingRegion)?;
        if self.header.meta_size != 0 {
            file.seek(SeekFrom::Start(self.written))?;
            file.write_all(self.meta.as_bytes()).map_err(|e| {
                error!("Failed to write meta");
                Error::from(e)
            })?;
        }

        callback(self.total_size, self.total_size);
        Ok(())
    }

    /// Cancels the current work; only effective during `add_content`.
    pub fn abort(&self) {
        if let Some(handle) = self.abort_ncch.lock().unwrap().as_ref() {
            handle.abort();
        }
        self.copier.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::no_progress;
    use crate::crypto::sha256;
    use crate::ncch::tests::build_plaintext_ncch;
    use crate::tmd::ContentChunk;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn build_output_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("out.cia")
    }

    #[test]
    fn standard_build_decrypts_and_rehashes() {
        let _guard = key::tests::lock();
        key::clear_keys();
        cert::tests::install_fake_cia_certs();

        let ncch_image = build_plaintext_ncch(0x1000, &[0x21; 0x200]);
        let chunk = ContentChunk::new(0, 0, content_type_flag::ENCRYPTED, ncch_image.len() as u64);
        let tmd = TitleMetadata::from_chunks(0x0004_0000_0002_0000, vec![chunk]);

        let dir = tempfile::tempdir().unwrap();
        let path = build_output_path(&dir);

        let mut builder = CiaBuilder::new(None, None);
        builder
            .init(BuildMode::Standard, &path, tmd, 0x10000, no_progress())
            .unwrap();
        let mut ncch = NcchContainer::new(Cursor::new(ncch_image.clone()));
        builder.add_content(0, &mut ncch, no_progress()).unwrap();
        builder.finalize(no_progress()).unwrap();
        builder.cleanup();

        let bytes = fs::read(&path).unwrap();
        let header = CiaHeader::read_from(&bytes, 0).unwrap();
        assert_eq!(header.header_size, CIA_HEADER_SIZE as u32);
        assert_eq!(header.cert_size, CIA_CERT_SIZE as u32);
        assert_eq!(header.content_size, ncch_image.len() as u64);
        assert!(header.is_content_present(0));
        assert!(!header.is_content_present(1));
        // Index 0 is the MSB of bitmap byte 0
        assert_eq!(header.content_present[0], 0x80);
        // Main content of an application carries a meta section
        assert_eq!(header.meta_size, CIA_METADATA_SIZE as u32);

        let tmd_offset = {
            let cert_offset = align_up(CIA_HEADER_SIZE, CIA_ALIGNMENT);
            let ticket_offset = align_up(cert_offset + header.cert_size as usize, CIA_ALIGNMENT);
            align_up(ticket_offset + header.tik_size as usize, CIA_ALIGNMENT)
        };
        let parsed_tmd = TitleMetadata::load(&bytes, tmd_offset).unwrap();
        parsed_tmd.verify_hashes().unwrap();
        // The content was written decrypted: hash covers the plaintext and
        // the encrypted flag is gone.
        assert_eq!(parsed_tmd.chunks[0].hash(), &sha256(&ncch_image));
        assert!(!parsed_tmd.chunks[0].is_encrypted());

        // Content payload sits decrypted at the aligned content offset.
        let content_offset = align_up(tmd_offset + header.tmd_size as usize, CIA_ALIGNMENT);
        assert_eq!(
            &bytes[content_offset..content_offset + ncch_image.len()],
            &ncch_image[..]
        );
        key::clear_keys();
    }

    #[test]
    fn legit_build_rejects_corrupted_tmd_without_touching_path() {
        let _guard = key::tests::lock();
        cert::tests::install_fake_cia_certs();

        let chunk = ContentChunk::new(0, 0, 0, 0x1000);
        let mut tmd = TitleMetadata::from_chunks(0x0004_0000_0003_0000, vec![chunk]);
        // Flip one bit in the info-array hash.
        tmd.body.corrupt_contentinfo_hash_for_tests();

        let dir = tempfile::tempdir().unwrap();
        let path = build_output_path(&dir);

        let mut builder = CiaBuilder::new(None, None);
        assert!(builder
            .init(BuildMode::Legit, &path, tmd, 0x10000, no_progress())
            .is_err());
        assert!(!path.exists());
    }

    fn signing_keypair() -> (rsa::RsaPrivateKey, Vec<u8>) {
        use rsa::traits::PublicKeyParts;

        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let modulus = private.n().to_bytes_be();
        let exponent = private.e().to_bytes_be();

        let mut public_key = vec![0u8; 0x138];
        public_key[0x100 - modulus.len()..0x100].copy_from_slice(&modulus);
        public_key[0x104 - exponent.len()..0x104].copy_from_slice(&exponent);
        (private, public_key)
    }

    fn sign(private: &rsa::RsaPrivateKey, message_hash: &[u8]) -> Vec<u8> {
        private
            .sign(rsa::Pkcs1v15Sign::new::<Sha256>(), message_hash)
            .unwrap()
    }

    #[test]
    fn legit_build_keeps_encryption_and_original_ticket() {
        let _guard = key::tests::lock();
        key::clear_keys();
        cert::tests::install_fake_cia_certs();

        // Give the CP and XS certs a real keypair so signatures verify.
        let (private, public_key) = signing_keypair();
        cert::tests::set_public_key_for_tests("Root-CA00000003-CP0000000b", public_key.clone());
        cert::tests::set_public_key_for_tests("Root-CA00000003-XS0000000c", public_key);

        let title_id = 0x0004_0000_0004_0000u64;
        let content: Vec<u8> = build_plaintext_ncch(0x1000, &[0x66; 0x200]);

        let mut chunk = ContentChunk::new(0, 0, content_type_flag::ENCRYPTED, content.len() as u64);
        chunk.set_hash(sha256(&content));
        let mut tmd = TitleMetadata::from_chunks(title_id, vec![chunk]);
        tmd.body.issuer = crate::string::SizedCString::from_str_padded("Root-CA00000003-CP0000000b");
        tmd.fix_hashes().unwrap();
        tmd.signature.data = sign(&private, &sha256(tmd.body.as_bytes()));

        // A signed console ticket in the ticket DB.
        let mut ticket = build_fake_ticket(title_id);
        let ticket_digest = {
            let mut hasher = Sha256::new();
            hasher.update(ticket.body.as_bytes());
            hasher.update(&ticket.content_index);
            hasher.finalize()
        };
        ticket.signature.data = sign(&private, &ticket_digest);
        let mut tickets = HashMap::new();
        tickets.insert(title_id, ticket);
        let ticket_db = Arc::new(TicketDb { tickets });

        let dir = tempfile::tempdir().unwrap();
        let path = build_output_path(&dir);

        let mut builder = CiaBuilder::new(Some(ticket_db), None);
        builder
            .init(BuildMode::Legit, &path, tmd, 0x10000, no_progress())
            .unwrap();
        let mut ncch = NcchContainer::new(Cursor::new(content.clone()));
        builder.add_content(0, &mut ncch, no_progress()).unwrap();
        builder.finalize(no_progress()).unwrap();
        builder.cleanup();

        let bytes = fs::read(&path).unwrap();
        let header = CiaHeader::read_from(&bytes, 0).unwrap();
        assert!(header.is_content_present(0));

        // Content is CBC re-encrypted with the (zero, since no common key
        // X is loaded) title key and the index IV.
        let content_offset = {
            let cert_offset = align_up(CIA_HEADER_SIZE, CIA_ALIGNMENT);
            let ticket_offset = align_up(cert_offset + header.cert_size as usize, CIA_ALIGNMENT);
            let tmd_offset = align_up(ticket_offset + header.tik_size as usize, CIA_ALIGNMENT);
            align_up(tmd_offset + header.tmd_size as usize, CIA_ALIGNMENT)
        };
        let mut expected = content.clone();
        let mut transform = CryptoTransform::cbc_encrypt_hash(&[0u8; 0x10], &[0u8; 0x10]);
        transform.process(&mut expected);
        assert_eq!(&bytes[content_offset..content_offset + content.len()], &expected[..]);
        key::clear_keys();
    }

    #[test]
    fn pirate_legit_build_rejects_wrong_content_hash() {
        let _guard = key::tests::lock();
        key::clear_keys();
        cert::tests::install_fake_cia_certs();

        let (private, public_key) = signing_keypair();
        cert::tests::set_public_key_for_tests("Root-CA00000003-CP0000000b", public_key);

        let content = build_plaintext_ncch(0x1000, &[0x66; 0x200]);
        let mut chunk = ContentChunk::new(0, 0, content_type_flag::ENCRYPTED, content.len() as u64);
        // Deliberately wrong content hash
        chunk.set_hash([0xAB; 0x20]);
        let mut tmd = TitleMetadata::from_chunks(0x0004_0000_0005_0000, vec![chunk]);
        tmd.body.issuer = crate::string::SizedCString::from_str_padded("Root-CA00000003-CP0000000b");
        tmd.fix_hashes().unwrap();
        tmd.signature.data = sign(&private, &sha256(tmd.body.as_bytes()));

        let dir = tempfile::tempdir().unwrap();
        let path = build_output_path(&dir);

        let mut builder = CiaBuilder::new(None, None);
        builder
            .init(BuildMode::PirateLegit, &path, tmd, 0x10000, no_progress())
            .unwrap();
        let mut ncch = NcchContainer::new(Cursor::new(content));
        assert!(matches!(
            builder.add_content(0, &mut ncch, no_progress()),
            Err(Error::HashMismatch)
        ));
        key::clear_keys();
    }
}
