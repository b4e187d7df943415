use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::copier::{CopyControl, FileCopier, ProgressCallback};
use crate::crypto::{sha256, AesKey, CryptoTransform};
use crate::key::{self, slot};
use crate::seeddb;
use crate::string::SizedCString;
use crate::{Error, Layout, Result};

use bitflags::bitflags;
use log::{debug, error, warn};
use static_assertions::assert_eq_size;

/// Size of content blocks (media units), in bytes
const BLOCK_SIZE: u64 = 0x200;
/// Maximum number of sections (files) in an ExeFS
const MAX_SECTIONS: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NcchCrypto: u8 {
        const FIXED_KEY = 0x1;
        const NO_ROMFS = 0x2;
        const NO_CRYPTO = 0x4;
        const SEED_CRYPTO = 0x20;
        const _ = !0;
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct NcchHeader {
    pub signature: [u8; 0x100],
    pub magic: [u8; 4],
    pub content_size: u32,
    pub partition_id: [u8; 8],
    pub maker_code: u16,
    pub version: u16,
    _reserved0: [u8; 4],
    pub program_id: u64,
    _reserved1: [u8; 0x10],
    pub logo_region_hash: [u8; 0x20],
    pub product_code: SizedCString<0x10>,
    pub extended_header_hash: [u8; 0x20],
    pub extended_header_size: u32,
    _reserved2: [u8; 4],
    _reserved_flag: [u8; 3],
    pub secondary_key_slot: u8,
    pub platform: u8,
    pub content_type_flags: u8,
    pub content_unit_size: u8,
    pub crypto_flags: u8,
    pub plain_region_offset: u32,
    pub plain_region_size: u32,
    pub logo_region_offset: u32,
    pub logo_region_size: u32,
    pub exefs_offset: u32,
    pub exefs_size: u32,
    pub exefs_hash_region_size: u32,
    _reserved3: [u8; 4],
    pub romfs_offset: u32,
    pub romfs_size: u32,
    pub romfs_hash_region_size: u32,
    _reserved4: [u8; 4],
    pub exefs_super_block_hash: [u8; 0x20],
    pub romfs_super_block_hash: [u8; 0x20],
}
assert_eq_size!([u8; 0x200], NcchHeader);
unsafe impl Layout for NcchHeader {}

impl NcchHeader {
    #[must_use]
    pub fn crypto(&self) -> NcchCrypto {
        NcchCrypto::from_bits_retain(self.crypto_flags)
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExeFsSectionHeader {
    pub name: SizedCString<8>,
    pub offset: u32,
    pub size: u32,
}
assert_eq_size!([u8; 0x10], ExeFsSectionHeader);
unsafe impl Layout for ExeFsSectionHeader {}

impl ExeFsSectionHeader {
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.offset == 0 && self.size == 0
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExeFsHeader {
    pub sections: [ExeFsSectionHeader; MAX_SECTIONS],
    _reserved: [u8; 0x80],
    pub hashes: [[u8; 0x20]; MAX_SECTIONS],
}
assert_eq_size!([u8; 0x200], ExeFsHeader);
unsafe impl Layout for ExeFsHeader {}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CodeSegmentInfo {
    pub address: u32,
    pub num_max_pages: u32,
    pub code_size: u32,
}
assert_eq_size!([u8; 0xC], CodeSegmentInfo);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CodeSetInfo {
    pub name: SizedCString<8>,
    pub flags: [u8; 8],
    pub text: CodeSegmentInfo,
    pub stack_size: u32,
    pub ro: CodeSegmentInfo,
    _reserved0: [u8; 4],
    pub data: CodeSegmentInfo,
    pub bss_size: u32,
}
assert_eq_size!([u8; 0x40], CodeSetInfo);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExHeaderSystemInfo {
    pub save_data_size: u64,
    pub jump_id: u64,
    _reserved0: [u8; 0x30],
}
assert_eq_size!([u8; 0x40], ExHeaderSystemInfo);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct StorageInfo {
    pub ext_save_data_id: u64,
    pub system_save_data_id: [u8; 8],
    pub storage_accessible_unique_ids: u64,
    pub access_info: [u8; 7],
    pub other_attributes: u8,
}
assert_eq_size!([u8; 0x20], StorageInfo);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Arm11SystemLocalCaps {
    pub program_id: u64,
    pub core_version: u32,
    _reserved_flags: [u8; 2],
    pub flags0: u8,
    pub priority: u8,
    pub resource_limit_descriptor: [[u8; 2]; 0x10],
    pub storage_info: StorageInfo,
    pub service_access_control: [[u8; 8]; 0x20],
    pub ex_service_access_control: [[u8; 8]; 2],
    _reserved0: [u8; 0xF],
    pub resource_limit_category: u8,
}
assert_eq_size!([u8; 0x170], Arm11SystemLocalCaps);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Arm11KernelCaps {
    pub descriptors: [u32; 28],
    _reserved0: [u8; 0x10],
}
assert_eq_size!([u8; 0x80], Arm11KernelCaps);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Arm9AccessControl {
    pub descriptors: [u8; 15],
    pub descversion: u8,
}
assert_eq_size!([u8; 0x10], Arm9AccessControl);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExHeaderAccessDesc {
    pub signature: [u8; 0x100],
    pub ncch_public_key_modulus: [u8; 0x100],
    pub arm11_system_local_caps: Arm11SystemLocalCaps,
    pub arm11_kernel_caps: Arm11KernelCaps,
    pub arm9_access_control: Arm9AccessControl,
}
assert_eq_size!([u8; 0x400], ExHeaderAccessDesc);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ExHeader {
    pub codeset_info: CodeSetInfo,
    pub dependency_list: [u64; 0x30],
    pub system_info: ExHeaderSystemInfo,
    pub arm11_system_local_caps: Arm11SystemLocalCaps,
    pub arm11_kernel_caps: Arm11KernelCaps,
    pub arm9_access_control: Arm9AccessControl,
    pub access_desc: ExHeaderAccessDesc,
}
assert_eq_size!([u8; 0x800], ExHeader);
unsafe impl Layout for ExHeader {}

impl ExHeader {
    /// Raw bytes of the dependency list, as copied into CIA meta sections.
    #[must_use]
    pub fn dependency_bytes(&self) -> [u8; 0x180] {
        let mut out = [0u8; 0x180];
        for (i, id) in self.dependency_list.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&id.to_le_bytes());
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionType {
    None,
    FixedKey,
    Secure1,
    Secure2,
    Secure3,
    Secure4,
}

/// Cancellation handle for an in-flight `decrypt_to_file`.
#[derive(Clone)]
pub struct NcchAbortHandle {
    aborted: Arc<AtomicBool>,
    control: Arc<CopyControl>,
}

impl NcchAbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.control.abort();
    }
}

/// Parser and streaming decryptor for the executable container format.
///
/// Only reads headers eagerly; section payloads are streamed on demand.
/// Decryption failures at load time are remembered and only become fatal
/// when an encrypted section is actually accessed.
pub struct NcchContainer<F> {
    file: F,
    is_loaded: bool,
    has_header: bool,
    has_exheader: bool,
    has_exefs: bool,
    has_romfs: bool,
    is_encrypted: bool,
    missing_key_slot: Option<usize>,
    header: NcchHeader,
    exheader: ExHeader,
    exefs_header: ExeFsHeader,
    // for decrypting exheader, exefs header and icon/banner sections
    primary_key: AesKey,
    // for decrypting romfs and .code
    secondary_key: AesKey,
    exheader_ctr: AesKey,
    exefs_ctr: AesKey,
    romfs_ctr: AesKey,
    exefs_offset: u64,
    aborted: Arc<AtomicBool>,
    copier: FileCopier,
}

impl<F: Read + Seek + Send> NcchContainer<F> {
    pub fn new(file: F) -> Self {
        Self {
            file,
            is_loaded: false,
            has_header: false,
            has_exheader: false,
            has_exefs: false,
            has_romfs: false,
            is_encrypted: false,
            missing_key_slot: None,
            header: NcchHeader::zeroed(),
            exheader: ExHeader::zeroed(),
            exefs_header: ExeFsHeader::zeroed(),
            primary_key: [0; 0x10],
            secondary_key: [0; 0x10],
            exheader_ctr: [0; 0x10],
            exefs_ctr: [0; 0x10],
            romfs_ctr: [0; 0x10],
            exefs_offset: 0,
            aborted: Arc::new(AtomicBool::new(false)),
            copier: FileCopier::new(),
        }
    }

    fn read_struct<T: Layout>(&mut self) -> Result<T> {
        let mut buffer = vec![0u8; core::mem::size_of::<T>()];
        self.file.read_exact(&mut buffer)?;
        T::read_from(&buffer, 0)
    }

    fn derive_keys(&mut self) -> Result<()> {
        let crypto = self.header.crypto();
        if crypto.contains(NcchCrypto::FIXED_KEY) {
            debug!("Fixed-key crypto");
            self.primary_key = [0; 0x10];
            self.secondary_key = [0; 0x10];
            return Ok(());
        }

        let mut key_y_primary = [0u8; 0x10];
        key_y_primary.copy_from_slice(&self.header.signature[..0x10]);

        let key_y_secondary = if crypto.contains(NcchCrypto::SEED_CRYPTO) {
            match seeddb::get_seed(self.header.program_id) {
                Some(seed) => {
                    let mut input = [0u8; 0x20];
                    input[..0x10].copy_from_slice(&key_y_primary);
                    input[0x10..].copy_from_slice(&seed);
                    let hash = sha256(&input);
                    let mut key_y = [0u8; 0x10];
                    key_y.copy_from_slice(&hash[..0x10]);
                    key_y
                }
                None => {
                    error!("Seed for program {:016X} not found", self.header.program_id);
                    self.missing_key_slot = Some(slot::NCCH_SECURE1);
                    key_y_primary
                }
            }
        } else {
            key_y_primary
        };

        key::set_key_y(slot::NCCH_SECURE1, key_y_primary);
        match key::normal_key(slot::NCCH_SECURE1) {
            Ok(normal) => self.primary_key = normal,
            Err(_) => {
                error!("Secure1 KeyX missing");
                self.missing_key_slot = Some(slot::NCCH_SECURE1);
            }
        }

        let secondary_slot = match self.header.secondary_key_slot {
            0 => slot::NCCH_SECURE1,
            1 => slot::NCCH_SECURE2,
            10 => slot::NCCH_SECURE3,
            11 => slot::NCCH_SECURE4,
            other => {
                error!("Unknown secondary key slot {other:#x}");
                return Err(Error::Unsupported("NCCH secondary key slot"));
            }
        };
        key::set_key_y(secondary_slot, key_y_secondary);
        match key::normal_key(secondary_slot) {
            Ok(normal) => self.secondary_key = normal,
            Err(_) => {
                error!("{secondary_slot:#04X} KeyX missing");
                self.missing_key_slot = Some(secondary_slot);
            }
        }
        Ok(())
    }

    fn derive_ctrs(&mut self) -> Result<()> {
        match self.header.version {
            0 | 2 => {
                debug!("NCCH version 0/2");
                // CTR for each section is a tag byte prefixed by the
                // partition ID in reverse order.
                for (i, b) in self.header.partition_id.iter().rev().enumerate() {
                    self.exheader_ctr[i] = *b;
                }
                self.exefs_ctr = self.exheader_ctr;
                self.romfs_ctr = self.exheader_ctr;
                self.exheader_ctr[8] = 1;
                self.exefs_ctr[8] = 2;
                self.romfs_ctr[8] = 3;
            }
            1 => {
                debug!("NCCH version 1");
                // CTR is the section offset prefixed by the partition ID,
                // as if the whole image were one CTR stream.
                self.exheader_ctr[..8].copy_from_slice(&self.header.partition_id);
                self.exefs_ctr = self.exheader_ctr;
                self.romfs_ctr = self.exheader_ctr;
                self.exheader_ctr[12..].copy_from_slice(&0x200u32.to_be_bytes());
                self.exefs_ctr[12..]
                    .copy_from_slice(&self.header.exefs_offset.wrapping_mul(0x200).to_be_bytes());
                self.romfs_ctr[12..]
                    .copy_from_slice(&self.header.romfs_offset.wrapping_mul(0x200).to_be_bytes());
            }
            other => {
                error!("Unknown NCCH version {other}");
                return Err(Error::Unsupported("NCCH version"));
            }
        }
        Ok(())
    }

    /// Ensures headers are loaded and section keys derived.
    pub fn load(&mut self) -> Result<()> {
        if self.is_loaded {
            return Ok(());
        }

        // Reset read pointer in case this file has been read before.
        self.file.seek(SeekFrom::Start(0))?;
        self.header = self.read_struct::<NcchHeader>()?;
        if &self.header.magic != b"NCCH" {
            return Err(Error::InvalidMagic);
        }
        self.has_header = true;

        if !self.header.crypto().contains(NcchCrypto::NO_CRYPTO) {
            self.is_encrypted = true;
            self.derive_keys()?;
            self.derive_ctrs()?;
        } else {
            debug!("No crypto");
            self.is_encrypted = false;
        }

        // System archives and DLC don't have an extended header but have
        // a RomFS
        if self.header.extended_header_size != 0 {
            self.exheader = self.read_struct::<ExHeader>()?;

            if self.is_encrypted {
                // This ID check is masked to the low 32 bits as a toleration
                // of ill-formed ROMs created by merging games with updates.
                if (self.exheader.system_info.jump_id & 0xFFFF_FFFF)
                    == (self.header.program_id & 0xFFFF_FFFF)
                {
                    warn!("Marked as encrypted but the exheader is decrypted. Force no crypto.");
                    self.is_encrypted = false;
                } else {
                    if let Some(slot_id) = self.missing_key_slot {
                        error!("Failed to decrypt");
                        return Err(Error::MissingKey(slot_id));
                    }
                    let mut bytes = self.exheader.as_bytes().to_vec();
                    let mut transform =
                        CryptoTransform::aes_ctr(&self.primary_key, &self.exheader_ctr, 0);
                    transform.process(&mut bytes);
                    self.exheader = ExHeader::read_from(&bytes, 0)?;
                }
            }
            self.has_exheader = true;
        }

        // DLC can have an ExeFS and a RomFS but no extended header
        if self.header.exefs_size != 0 {
            self.exefs_offset = u64::from(self.header.exefs_offset) * BLOCK_SIZE;
            self.file.seek(SeekFrom::Start(self.exefs_offset))?;
            self.exefs_header = self.read_struct::<ExeFsHeader>()?;

            if self.is_encrypted {
                let mut bytes = self.exefs_header.as_bytes().to_vec();
                let mut transform =
                    CryptoTransform::aes_ctr(&self.primary_key, &self.exefs_ctr, 0);
                transform.process(&mut bytes);
                self.exefs_header = ExeFsHeader::read_from(&bytes, 0)?;
            }
            self.has_exefs = true;
        }

        if self.header.romfs_offset != 0 && self.header.romfs_size != 0 {
            self.has_romfs = true;
        }

        self.is_loaded = true;
        Ok(())
    }

    #[must_use]
    pub fn header(&self) -> &NcchHeader {
        &self.header
    }

    #[must_use]
    pub fn exheader(&self) -> Option<&ExHeader> {
        self.has_exheader.then_some(&self.exheader)
    }

    pub fn has_exefs(&mut self) -> bool {
        self.load().is_ok() && self.has_exefs
    }

    pub fn has_exheader(&mut self) -> bool {
        self.load().is_ok() && self.has_exheader
    }

    pub fn read_program_id(&mut self) -> Result<u64> {
        self.load()?;
        if !self.has_header {
            return Err(Error::MissingRegion);
        }
        Ok(self.header.program_id)
    }

    pub fn read_product_code(&mut self) -> Result<String> {
        self.load()?;
        if !self.has_header {
            return Err(Error::MissingRegion);
        }
        Ok(self.header.product_code.zero_terminated())
    }

    pub fn read_codeset_name(&mut self) -> Result<String> {
        self.load()?;
        if !self.has_exheader {
            return Err(Error::MissingRegion);
        }
        Ok(self.exheader.codeset_info.name.zero_terminated())
    }

    /// The extdata ID this title owns, from the exheader storage info.
    pub fn read_extdata_id(&mut self) -> Result<u64> {
        self.load()?;
        if !self.has_exheader {
            return Err(Error::MissingRegion);
        }

        let storage = &self.exheader.arm11_system_local_caps.storage_info;
        if storage.other_attributes >> 1 != 0 {
            // Using extended save data access, with multiple candidate IDs;
            // the best guess is the first non-zero one.
            let unique = storage.storage_accessible_unique_ids;
            let ext = storage.ext_save_data_id;
            let candidates = [
                (unique >> 40) & 0xFFFFF,
                (unique >> 20) & 0xFFFFF,
                unique & 0xFFFFF,
                (ext >> 40) & 0xFFFFF,
                (ext >> 20) & 0xFFFFF,
                ext & 0xFFFFF,
            ];
            return candidates
                .into_iter()
                .find(|id| *id != 0)
                .ok_or(Error::MissingRegion);
        }

        Ok(storage.ext_save_data_id)
    }

    pub fn encryption_type(&mut self) -> Result<EncryptionType> {
        self.load()?;
        if !self.is_encrypted {
            Ok(EncryptionType::None)
        } else if self.header.crypto().contains(NcchCrypto::FIXED_KEY) {
            Ok(EncryptionType::FixedKey)
        } else {
            match self.header.secondary_key_slot {
                0 => Ok(EncryptionType::Secure1),
                1 => Ok(EncryptionType::Secure2),
                10 => Ok(EncryptionType::Secure3),
                11 => Ok(EncryptionType::Secure4),
                other => {
                    error!("Unknown encryption type {other:#X}");
                    Err(Error::Unsupported("NCCH secondary key slot"))
                }
            }
        }
    }

    pub fn uses_seed_crypto(&mut self) -> Result<bool> {
        self.load()?;
        Ok(self.header.crypto().contains(NcchCrypto::SEED_CRYPTO))
    }

    /// Reads a named ExeFS section (non-compressed, primary key only).
    pub fn load_section_exefs(&mut self, name: &str) -> Result<Vec<u8>> {
        self.load()?;
        if !self.has_exefs {
            return Err(Error::MissingRegion);
        }

        let sections = self.exefs_header.sections;
        for section in sections.iter().filter(|s| !s.is_unused()) {
            if section.name.zero_terminated() != name {
                continue;
            }
            debug!(
                "Loading ExeFS section {} - offset: {:#010X}, size: {:#010X}",
                name, section.offset, section.size
            );

            let section_offset =
                u64::from(section.offset) + self.exefs_offset + core::mem::size_of::<ExeFsHeader>() as u64;
            self.file.seek(SeekFrom::Start(section_offset))?;

            let mut buffer = vec![0u8; section.size as usize];
            self.file.read_exact(&mut buffer)?;
            if self.is_encrypted {
                if let Some(slot_id) = self.missing_key_slot {
                    return Err(Error::MissingKey(slot_id));
                }
                let mut transform = CryptoTransform::aes_ctr(
                    &self.primary_key,
                    &self.exefs_ctr,
                    u64::from(section.offset) + core::mem::size_of::<ExeFsHeader>() as u64,
                );
                transform.process(&mut buffer);
            }
            return Ok(buffer);
        }
        Err(Error::MissingRegion)
    }

    #[must_use]
    pub fn abort_handle(&self) -> NcchAbortHandle {
        NcchAbortHandle {
            aborted: Arc::clone(&self.aborted),
            control: self.copier.control(),
        }
    }

    /// Size of the backing image.
    pub fn file_size(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    /// The raw (still encrypted) backing stream, for callers that repack
    /// the image as-is.
    pub fn raw_file(&mut self) -> &mut F {
        &mut self.file
    }

    /// Rewrites the container into `dest` with every section decrypted and
    /// the crypto flags normalized. Gaps between regions are zero-filled.
    pub fn decrypt_to_file<W: Write + Send>(
        &mut self,
        dest: &mut W,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        self.load()?;
        if !self.has_header {
            return Err(Error::MissingRegion);
        }
        self.aborted.store(false, Ordering::SeqCst);

        let size = self.file_size()?;
        if !self.is_encrypted {
            // Simply copy everything
            self.file.seek(SeekFrom::Start(0))?;
            self.copier.reset(size);
            self.copier.set_transform(None);
            return self.copier.run(&mut self.file, size, dest, callback);
        }

        if let Some(slot_id) = self.missing_key_slot {
            error!("Failed to decrypt");
            return Err(Error::MissingKey(slot_id));
        }

        // Headers are written directly instead of through the copier.
        let mut total_size = size - core::mem::size_of::<NcchHeader>() as u64;
        if self.has_exheader {
            total_size -= core::mem::size_of::<ExHeader>() as u64;
        }
        if self.has_exefs {
            total_size -= core::mem::size_of::<ExeFsHeader>() as u64;
        }
        self.copier.reset(total_size);

        let mut written: u64;

        // NCCH header, with crypto normalized out
        let mut modified_header = self.header;
        modified_header.crypto_flags = NcchCrypto::NO_CRYPTO.bits();
        modified_header.secondary_key_slot = 0;
        dest.write_all(modified_header.as_bytes())?;
        written = core::mem::size_of::<NcchHeader>() as u64;

        if self.has_exheader {
            dest.write_all(self.exheader.as_bytes())?;
            written += core::mem::size_of::<ExHeader>() as u64;
        }

        let header = self.header;
        let exefs_header = self.exefs_header;
        let has_exefs = self.has_exefs;
        let has_romfs = self.has_romfs;
        let primary_key = self.primary_key;
        let secondary_key = self.secondary_key;
        let exefs_ctr = self.exefs_ctr;
        let romfs_ctr = self.romfs_ctr;

        self.write_region(
            dest,
            "logo",
            u64::from(header.logo_region_offset) * BLOCK_SIZE,
            u64::from(header.logo_region_size) * BLOCK_SIZE,
            None,
            &mut written,
            callback,
        )?;
        self.write_region(
            dest,
            "plain region",
            u64::from(header.plain_region_offset) * BLOCK_SIZE,
            u64::from(header.plain_region_size) * BLOCK_SIZE,
            None,
            &mut written,
            callback,
        )?;

        if has_exefs {
            dest.write_all(exefs_header.as_bytes())?;
            written += core::mem::size_of::<ExeFsHeader>() as u64;

            for section in exefs_header.sections.iter().filter(|s| !s.is_unused()) {
                let name = section.name.zero_terminated();
                // icon/banner use the primary key, everything else the
                // secondary, seeking the shared ExeFS CTR to the section
                let key = if name == "icon" || name == "banner" {
                    primary_key
                } else {
                    secondary_key
                };

                // Plus one block for the ExeFS header itself
                self.write_region(
                    dest,
                    &name,
                    u64::from(section.offset) + (u64::from(header.exefs_offset) + 1) * BLOCK_SIZE,
                    u64::from(section.size),
                    Some((
                        key,
                        exefs_ctr,
                        u64::from(section.offset) + core::mem::size_of::<ExeFsHeader>() as u64,
                    )),
                    &mut written,
                    callback,
                )?;
            }
        }

        if has_romfs {
            self.write_region(
                dest,
                "romfs",
                u64::from(header.romfs_offset) * BLOCK_SIZE,
                u64::from(header.romfs_size) * BLOCK_SIZE,
                Some((secondary_key, romfs_ctr, 0)),
                &mut written,
                callback,
            )?;
        }

        if written < size {
            warn!("Data after {written:#x} ignored");
        }
        callback(total_size, total_size);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_region<W: Write + Send>(
        &mut self,
        dest: &mut W,
        name: &str,
        offset: u64,
        size: u64,
        crypto: Option<(AesKey, AesKey, u64)>,
        written: &mut u64,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        if offset == 0 || size == 0 {
            return Ok(());
        }
        if self.aborted.swap(false, Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        if *written > offset {
            error!("Region offsets are not in increasing order");
            return Err(Error::OutOfRange);
        }

        // Zero out the gap
        let zeroes = [0u8; 1024];
        let mut zeroes_left = offset - *written;
        while zeroes_left > 0 {
            let to_write = (zeroes.len() as u64).min(zeroes_left);
            dest.write_all(&zeroes[..to_write as usize]).map_err(|e| {
                error!("Could not write zeroes before {name}");
                Error::from(e)
            })?;
            zeroes_left -= to_write;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        if self.aborted.swap(false, Ordering::SeqCst) {
            return Err(Error::Aborted);
        }

        self.copier.set_transform(
            crypto.map(|(key, ctr, seek_pos)| CryptoTransform::aes_ctr(&key, &ctr, seek_pos)),
        );
        self.copier
            .run(&mut self.file, size, dest, callback)
            .map_err(|e| {
                error!("Could not write {name}");
                e
            })?;
        *written = offset + size;
        Ok(())
    }
}
