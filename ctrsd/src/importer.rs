use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cert;
use crate::cia::{BuildMode, CiaBuilder};
use crate::container::DataContainer;
use crate::copier::{FileCopier, ProgressCallback, ProgressWrapper};
use crate::extdata::{Extdata, ExtdataSource};
use crate::key::{self, slot};
use crate::ncch::{NcchAbortHandle, NcchContainer};
use crate::savegame::Savegame;
use crate::sdmc::{SdmcDecryptor, SdmcFile};
use crate::seeddb::{self, SeedDb};
use crate::smdh::{Smdh, TitleLanguage, SMDH_SIZE};
use crate::titledb::{TicketDb, TitleDb};
use crate::titlekeys;
use crate::tmd::{content_type_flag, TitleMetadata};
use crate::{Error, Layout, Result};

use log::{error, info, warn};
use sha2::{Digest, Sha256};

pub const BOOTROM9: &str = "boot9.bin";
pub const SEED_DB: &str = "seeddb.bin";
pub const SECRET_SECTOR: &str = "sector0x96.bin";
pub const AES_KEYS: &str = "aes_keys.txt";
pub const MOVABLE_SED: &str = "movable.sed";
pub const CERTS_DB: &str = "certs.db";
pub const TITLE_DB: &str = "title.db";
pub const TICKET_DB: &str = "ticket.db";
pub const ENC_TITLE_KEYS_BIN: &str = "encTitleKeys.bin";

/// Version of the dumper this importer expects its inputs from.
pub const CURRENT_DUMPER_VERSION: i32 = 4;

/// Support directory the dumper leaves at the SD card root.
pub const DUMPER_DIR: &str = "threeSD";

const ZEROS_32: &str = "00000000000000000000000000000000";

/// Type of an importable content. Applications, updates and DLCs are all
/// plain titles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Title,
    Savegame,
    NandSavegame,
    Extdata,
    NandExtdata,
    Sysdata,
    NandTitle,
}

impl ContentType {
    #[must_use]
    pub fn is_title(self) -> bool {
        self == Self::Title || self == Self::NandTitle
    }
}

/// Specifies an importable content.
#[derive(Clone, Debug, Default)]
pub struct ContentSpecifier {
    pub content_type: ContentType,
    pub id: u64,
    /// Whether a file already exists in the target path.
    pub already_exists: bool,
    /// May be slightly bigger than the real size.
    pub maximum_size: u64,
    /// Optional preferred display name.
    pub name: String,
    /// Extdata ID, for applications.
    pub extdata_id: u64,
    /// Optional RGB565 icon.
    pub icon: Vec<u16>,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Title
    }
}

/// Paths the importer works with. Optional inputs degrade features when
/// absent instead of failing initialization.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// SDMC root path ("Nintendo 3DS/<ID0>/<ID1>")
    pub sdmc_path: PathBuf,
    /// Target user path of the emulator
    pub user_path: PathBuf,

    // System files keys are loaded from.
    pub movable_sed_path: PathBuf,
    pub bootrom_path: PathBuf,
    /// certs.db, used while building CIAs.
    pub certs_db_path: Option<PathBuf>,

    // Optional while building CIAs.
    pub nand_title_db_path: Option<PathBuf>,
    pub ticket_db_path: Option<PathBuf>,
    pub enc_title_keys_bin_path: Option<PathBuf>,

    // Optional; copied so the emulator can decrypt imported encrypted ROMs.
    pub seed_db_path: Option<PathBuf>,
    pub secret_sector_path: Option<PathBuf>,

    /// NAND title directory (".../title/").
    pub system_titles_path: Option<PathBuf>,
    /// NAND data directory (extdata and savedata).
    pub nand_data_path: Option<PathBuf>,

    /// Version of the dumper used.
    pub version: i32,
}

/// An openable content payload, decrypted transparently when it comes from
/// the SD card.
enum ContentFile {
    Sdmc(SdmcFile),
    Plain(fs::File),
}

impl ContentFile {
    fn size(&self) -> Result<u64> {
        match self {
            Self::Sdmc(file) => file.size(),
            Self::Plain(file) => Ok(file.metadata()?.len()),
        }
    }
}

impl Read for ContentFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Sdmc(file) => file.read(buf),
            Self::Plain(file) => file.read(buf),
        }
    }
}

impl Seek for ContentFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::Sdmc(file) => file.seek(pos),
            Self::Plain(file) => file.seek(pos),
        }
    }
}

/// Discards the data and only hashes it, for content verification.
struct HashOnlyWriter {
    sha: Sha256,
}

impl HashOnlyWriter {
    fn new() -> Self {
        Self { sha: Sha256::new() }
    }

    fn verify_hash(&mut self, expected: &[u8; 0x20]) -> bool {
        let digest: [u8; 0x20] = self.sha.finalize_reset().into();
        digest == *expected
    }
}

impl Write for HashOnlyWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sha.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn is_hex_id(name: &str, len: usize) -> bool {
    name.len() == len && name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn directory_tree_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            total += directory_tree_size(&entry.path());
        } else {
            total += metadata.len();
        }
    }
    total
}

fn normalize_filename(filename: &str) -> String {
    const ILLEGAL_CHARACTERS: [char; 8] = [':', '/', '\\', '"', '*', '?', '\n', '\r'];

    let replaced: String = filename
        .chars()
        .map(|c| if ILLEGAL_CHARACTERS.contains(&c) { ' ' } else { c })
        .collect();

    // Collapse runs of spaces left by the replacement
    let mut result = String::with_capacity(replaced.len());
    let mut last_was_space = false;
    for c in replaced.chars() {
        if c == ' ' && last_was_space {
            continue;
        }
        last_was_space = c == ' ';
        result.push(c);
    }
    result
}

struct TitleData {
    name: String,
    extdata_id: u64,
    icon: Vec<u16>,
}

/// Hand-picked names for contents whose SMDH is absent or confusing.
fn named_title(program_id: u64) -> Option<&'static str> {
    Some(match program_id {
        // System applications (to avoid confusion)
        0x0004_0010_2002_C800 => "New 3DS HOME Menu manual (JPN)",
        0x0004_0010_2002_CF00 => "New 3DS HOME Menu manual (USA)",
        0x0004_0010_2002_D000 => "New 3DS HOME Menu manual (EUR)",
        0x0004_0010_2002_D700 => "New 3DS HOME Menu manual (KOR)",
        0x0004_0010_2002_C900 => "New 3DS Friend List manual (JPN)",
        0x0004_0010_2002_D100 => "New 3DS Friend List manual (USA)",
        0x0004_0010_2002_D200 => "New 3DS Friend List manual (EUR)",
        0x0004_0010_2002_D800 => "New 3DS Friend List manual (KOR)",
        0x0004_0010_2002_CA00 => "New 3DS Notifications manual (JPN)",
        0x0004_0010_2002_D300 => "New 3DS Notifications manual (USA)",
        0x0004_0010_2002_D400 => "New 3DS Notifications manual (EUR)",
        0x0004_0010_2002_D900 => "New 3DS Notifications manual (KOR)",
        0x0004_0010_2002_CB00 => "New 3DS Game Notes manual (JPN)",
        0x0004_0010_2002_D500 => "New 3DS Game Notes manual (USA)",
        0x0004_0010_2002_D600 => "New 3DS Game Notes manual (EUR)",
        0x0004_0010_2002_DA00 => "New 3DS Game Notes manual (KOR)",
        // System archives
        0x0004_001B_0001_0002 => "ClCertA",
        0x0004_009B_0001_0202 => "Mii Data",
        0x0004_009B_0001_0402 => "Region Manifest",
        0x0004_009B_0001_4002 => "Shared Font (JPN/EUR/USA)",
        0x0004_009B_0001_4102 => "Shared Font (CHN)",
        0x0004_009B_0001_4202 => "Shared Font (KOR)",
        0x0004_009B_0001_4302 => "Shared Font (TWN)",
        0x0004_00DB_0001_0302 => "NGWord Bad word list",
        _ => return None,
    })
}

fn load_title_data<F: Read + Seek + Send>(ncch: &mut NcchContainer<F>) -> TitleData {
    let program_id = ncch.read_program_id().unwrap_or_default();
    let extdata_id = ncch.read_extdata_id().unwrap_or_default();
    let codeset_name = ncch.read_codeset_name().unwrap_or_default();

    let mut title_name = if codeset_name.is_empty() {
        String::new()
    } else {
        format!("{codeset_name} (0x{program_id:016x})")
    };
    if let Some(name) = named_title(program_id) {
        title_name = name.to_string();
    }

    // Load SMDH for name and icon
    let smdh_buffer = match ncch.load_section_exefs("icon") {
        Ok(buffer) => buffer,
        Err(_) => {
            warn!("Failed to load icon in ExeFS");
            return TitleData {
                name: title_name,
                extdata_id,
                icon: Vec::new(),
            };
        }
    };
    if smdh_buffer.len() != SMDH_SIZE {
        error!("ExeFS icon section size is not correct");
        return TitleData {
            name: title_name,
            extdata_id,
            icon: Vec::new(),
        };
    }

    let smdh = Smdh::read_from(&smdh_buffer, 0).expect("size checked above");
    if named_title(program_id).is_none() {
        title_name = smdh.short_title(TitleLanguage::English).to_string_lossy();
    }
    TitleData {
        name: title_name,
        extdata_id,
        icon: smdh.icon(false),
    }
}

fn title_file_name<F: Read + Seek + Send>(ncch: &mut NcchContainer<F>) -> String {
    let codeset_name = ncch.read_codeset_name().unwrap_or_default();
    let product_code = ncch.read_product_code().unwrap_or_default();
    let program_id = ncch.read_program_id().unwrap_or_default();

    match ncch.load_section_exefs("icon") {
        Ok(buffer) if buffer.len() == SMDH_SIZE => {
            let smdh = Smdh::read_from(&buffer, 0).expect("size checked above");
            let short_title = smdh.short_title(TitleLanguage::English).to_string_lossy();
            normalize_filename(&format!(
                "{:016X} {} ({}) ({})",
                program_id,
                short_title,
                product_code,
                smdh.region_string()
            ))
        }
        _ => {
            warn!("Failed to load icon in ExeFS or size incorrect");
            normalize_filename(&format!("{program_id:016X} {codeset_name} ({product_code})"))
        }
    }
}

/// Add a certain amount to the titles' maximum sizes, so that they are
/// always larger than CIA sizes.
const TITLE_SIZE_ALLOWANCE: u64 = 0xA000;

const SDMC_TITLE_HIGH_IDS: [u64; 3] = [0x0004_0000, 0x0004_000E, 0x0004_008C];
const NAND_TITLE_HIGH_IDS: [u64; 7] = [
    0x0004_0010,
    0x0004_001B,
    0x0004_0030,
    0x0004_009B,
    0x0004_00DB,
    0x0004_0130,
    0x0004_0138,
];
const DLC_TID_HIGH: u64 = 0x0004_008C;

/// Orchestrates migration of a console's SD installation into the
/// emulator's user directory, plus the CXI dump and CIA build workflows.
pub struct Importer {
    config: Config,
    sdmc_decryptor: SdmcDecryptor,
    file_copier: FileCopier,
    cia_builder: CiaBuilder,
    ticket_db: Option<Arc<TicketDb>>,
    sdmc_title_db: Option<TitleDb>,
    nand_title_db: Option<TitleDb>,
    dump_cxi_abort: Mutex<Option<NcchAbortHandle>>,
}

impl Importer {
    pub fn new(config: Config) -> Result<Self> {
        if config.sdmc_path.as_os_str().is_empty()
            || config.user_path.as_os_str().is_empty()
            || config.bootrom_path.as_os_str().is_empty()
            || config.movable_sed_path.as_os_str().is_empty()
        {
            error!("Config is not good");
            return Err(Error::MissingRegion);
        }

        key::clear_keys();
        if let Err(e) = key::load_bootrom_keys(&config.bootrom_path) {
            warn!("Failed to load bootrom keys: {e}");
        }
        if let Err(e) = key::load_movable_sed_keys(&config.movable_sed_path) {
            warn!("Failed to load movable.sed keys: {e}");
        }

        if !key::is_normal_key_available(slot::SD) {
            error!("SD key is not available");
            return Err(Error::MissingKey(slot::SD));
        }

        // Process-wide databases
        if let Some(path) = &config.seed_db_path {
            if let Err(e) = seeddb::load_global(path) {
                warn!("Failed to load seed database: {e}");
            }
        }
        if let Some(path) = &config.certs_db_path {
            if let Err(e) = cert::load(path) {
                warn!("Failed to load certificates: {e}");
            }
        }

        let ticket_db = config
            .ticket_db_path
            .as_ref()
            .and_then(|path| match TicketDb::from_file(path) {
                Ok(db) => Some(Arc::new(db)),
                Err(_) => {
                    warn!("ticket.db not present or is invalid");
                    None
                }
            });

        let enc_title_keys = config
            .enc_title_keys_bin_path
            .as_ref()
            .and_then(|path| match titlekeys::load(path) {
                Ok(map) => Some(map),
                Err(_) => {
                    warn!("encTitleKeys.bin invalid");
                    None
                }
            });

        let sdmc_decryptor = SdmcDecryptor::new(config.sdmc_path.clone())?;
        let cia_builder = CiaBuilder::new(ticket_db.clone(), enc_title_keys);

        let sdmc_title_db = sdmc_decryptor
            .decrypt_file("/dbs/title.db")
            .ok()
            .and_then(|data| DataContainer::new(data).ok())
            .and_then(|container| container.ivfc_level4_data().ok())
            .and_then(|mut data| TitleDb::from_data(data.swap_remove(0)).ok());
        if sdmc_title_db.is_none() {
            warn!("SDMC title.db invalid");
        }

        let nand_title_db = config
            .nand_title_db_path
            .as_ref()
            .and_then(|path| match TitleDb::from_file(path) {
                Ok(db) => Some(db),
                Err(_) => {
                    warn!("NAND title.db invalid");
                    None
                }
            });

        Ok(Self {
            config,
            sdmc_decryptor,
            file_copier: FileCopier::new(),
            cia_builder,
            ticket_db,
            sdmc_title_db,
            nand_title_db,
            dump_cxi_abort: Mutex::new(None),
        })
    }

    fn sdmc_citra_root(&self) -> PathBuf {
        self.config
            .user_path
            .join("sdmc/Nintendo 3DS")
            .join(ZEROS_32)
            .join(ZEROS_32)
    }

    fn nand_citra_root(&self) -> PathBuf {
        self.config.user_path.join("nand")
    }

    fn sysdata_path(&self) -> PathBuf {
        self.config.user_path.join("sysdata")
    }

    /// Imports a specific content, deleting its output when failed.
    /// Blocks, but can be aborted from another thread.
    pub fn import_content(
        &mut self,
        specifier: &ContentSpecifier,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        if let Err(e) = self.import_content_impl(specifier, callback) {
            self.delete_content(specifier);
            return Err(e);
        }
        Ok(())
    }

    fn import_content_impl(
        &mut self,
        specifier: &ContentSpecifier,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        match specifier.content_type {
            ContentType::Title => self.import_title(specifier, callback),
            ContentType::Savegame => self.import_savegame(specifier.id),
            ContentType::NandSavegame => self.import_nand_savegame(specifier.id),
            ContentType::Extdata => self.import_extdata(specifier.id),
            ContentType::NandExtdata => self.import_nand_extdata(specifier.id),
            ContentType::Sysdata => self.import_sysdata(specifier.id),
            ContentType::NandTitle => self.import_nand_title(specifier, callback),
        }
    }

    pub fn abort_importing(&self) {
        self.sdmc_decryptor.abort();
        self.file_copier.abort();
    }

    /// Collects every file under a title's content directory, skipping the
    /// cmd subdirectory (not used by the emulator).
    fn collect_content_files(dir: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let path = entry.path();
            if path.is_dir() {
                if name == "cmd" {
                    continue;
                }
                // Recurse, necessary for DLCs
                Self::collect_content_files(&path, &relative.join(&name), out)?;
            } else {
                out.push(relative.join(&name));
            }
        }
        Ok(())
    }

    fn import_title(
        &mut self,
        specifier: &ContentSpecifier,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        let relative = format!(
            "title/{:08x}/{:08x}/content",
            specifier.id >> 32,
            specifier.id & 0xFFFF_FFFF
        );
        let source_dir = self.config.sdmc_path.join(&relative);

        let mut files = Vec::new();
        Self::collect_content_files(&source_dir, Path::new(&relative), &mut files)?;

        self.sdmc_decryptor.reset_progress(specifier.maximum_size);
        let citra_root = self.sdmc_citra_root();
        for file in files {
            let rel_str = format!("/{}", file.to_string_lossy().replace('\\', "/"));
            self.sdmc_decryptor
                .decrypt_and_write_file(&rel_str, &citra_root.join(&file), callback)?;
        }
        Ok(())
    }

    fn import_nand_title(
        &mut self,
        specifier: &ContentSpecifier,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        let system_titles = self
            .config
            .system_titles_path
            .as_ref()
            .ok_or(Error::MissingRegion)?;
        // system_titles_path ends with "title/"; content is addressed
        // relative to its parent so the emulator paths line up.
        let base_path = system_titles.parent().ok_or(Error::MissingRegion)?;

        let relative = format!(
            "title/{:08x}/{:08x}/content",
            specifier.id >> 32,
            specifier.id & 0xFFFF_FFFF
        );
        let mut files = Vec::new();
        Self::collect_content_files(&base_path.join(&relative), Path::new(&relative), &mut files)?;

        self.file_copier.reset(specifier.maximum_size);
        self.file_copier.set_transform(None);
        let citra_root = self.nand_citra_root().join(ZEROS_32);
        for file in files {
            let physical_path = base_path.join(&file);
            let citra_path = citra_root.join(&file);
            if let Some(parent) = citra_path.parent() {
                fs::create_dir_all(parent)?;
            }
            // Crypto is not set: plain copy with progress.
            let mut source = fs::File::open(&physical_path)?;
            let size = source.metadata()?.len();
            let mut dest = fs::File::create(&citra_path)?;
            self.file_copier.run(&mut source, size, &mut dest, callback)?;
        }
        Ok(())
    }

    fn import_savegame(&mut self, id: u64) -> Result<()> {
        let path = format!("title/{:08x}/{:08x}/data/", id >> 32, id & 0xFFFF_FFFF);

        let container =
            DataContainer::new(self.sdmc_decryptor.decrypt_file(&format!("/{path}00000001.sav"))?)?;
        let save = Savegame::new(container.ivfc_level4_data()?)?;
        save.extract(&self.sdmc_citra_root().join(path))
    }

    fn import_nand_savegame(&mut self, id: u64) -> Result<()> {
        let nand_data = self
            .config
            .nand_data_path
            .as_ref()
            .ok_or(Error::MissingRegion)?;
        let path = format!("sysdata/{:08x}/00000000", id & 0xFFFF_FFFF);

        let data = fs::read(nand_data.join(&path)).map_err(|e| {
            error!("Failed to read from {path}");
            Error::from(e)
        })?;
        let container = DataContainer::new(data)?;
        let save = Savegame::new(container.ivfc_level4_data()?)?;
        save.extract_directory(
            &self.nand_citra_root().join("data").join(ZEROS_32).join(&path),
            1,
        )
    }

    fn import_extdata(&mut self, id: u64) -> Result<()> {
        let path = format!("extdata/{:08x}/{:08x}/", id >> 32, id & 0xFFFF_FFFF);
        let extdata = Extdata::new(ExtdataSource::Sdmc {
            data_path: format!("/{path}"),
            decryptor: &self.sdmc_decryptor,
        })?;
        extdata.extract(&self.sdmc_citra_root().join(path))
    }

    fn import_nand_extdata(&mut self, id: u64) -> Result<()> {
        let nand_data = self
            .config
            .nand_data_path
            .as_ref()
            .ok_or(Error::MissingRegion)?;
        let path = format!("extdata/{:08x}/{:08x}/", id >> 32, id & 0xFFFF_FFFF);
        let extdata = Extdata::new(ExtdataSource::Plain(nand_data.join(&path)))?;
        extdata.extract(&self.nand_citra_root().join("data").join(ZEROS_32).join(path))
    }

    fn import_sysdata(&mut self, id: u64) -> Result<()> {
        match id {
            0 => {
                // bootrom
                let target = self.sysdata_path().join(BOOTROM9);
                info!(
                    "Copying {} from {} to {}",
                    BOOTROM9,
                    self.config.bootrom_path.display(),
                    target.display()
                );
                fs::create_dir_all(target.parent().unwrap())?;
                fs::copy(&self.config.bootrom_path, target)?;
                Ok(())
            }
            1 => {
                // seed db: merge new seeds into the destination database
                let source_path = self
                    .config
                    .seed_db_path
                    .as_ref()
                    .ok_or(Error::MissingRegion)?;
                let target_path = self.sysdata_path().join(SEED_DB);
                info!(
                    "Merging seed database from {} into {}",
                    source_path.display(),
                    target_path.display()
                );

                let mut target = SeedDb::load(&target_path)?;
                let source = SeedDb::load(source_path)?;
                for seed in &source.seeds {
                    if target.get(seed.title_id).is_none() {
                        info!("Adding seed for {:016X}", seed.title_id);
                        target.add(*seed);
                    }
                }
                target.save(&target_path)
            }
            2 => {
                // secret sector
                let source = self
                    .config
                    .secret_sector_path
                    .as_ref()
                    .ok_or(Error::MissingRegion)?;
                let target = self.sysdata_path().join(SECRET_SECTOR);
                info!(
                    "Copying {} from {} to {}",
                    SECRET_SECTOR,
                    source.display(),
                    target.display()
                );
                fs::create_dir_all(target.parent().unwrap())?;
                fs::copy(source, target)?;
                Ok(())
            }
            3 => {
                // aes_keys.txt
                let target = self.sysdata_path().join(AES_KEYS);
                fs::create_dir_all(target.parent().unwrap())?;
                let mut file = fs::File::create(target)?;
                for slot_id in [0x25usize, 0x18, 0x1B] {
                    let key = key::key_x(slot_id).unwrap_or_default();
                    writeln!(file, "slot0x{slot_id:02X}KeyX={}", key::key_to_string(&key))?;
                }
                Ok(())
            }
            _ => {
                error!("Unexpected sysdata id {id}");
                Err(Error::OutOfRange)
            }
        }
    }

    /// Looks for the TMD of a title, preferring the content ID recorded in
    /// the title database and falling back to a directory scan.
    fn find_tmd(path: &Path) -> Option<PathBuf> {
        let mut best: Option<String> = None;
        for entry in fs::read_dir(path).ok()?.flatten() {
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.len() == 12 && name.ends_with(".tmd") && is_hex_id(&name[..8], 8) {
                // The smallest content ID is the finalized version, not one
                // pending installation.
                best = Some(match best {
                    Some(current) => current.min(name),
                    None => name,
                });
            }
        }
        best.map(|name| path.join(name))
    }

    pub fn load_tmd(&self, content_type: ContentType, id: u64) -> Result<TitleMetadata> {
        let is_nand = content_type == ContentType::NandTitle;

        let title_db = if is_nand {
            &self.nand_title_db
        } else {
            &self.sdmc_title_db
        };
        let physical_path = if is_nand {
            self.config
                .system_titles_path
                .as_ref()
                .ok_or(Error::MissingRegion)?
                .join(format!("{:08x}/{:08x}/content", id >> 32, id & 0xFFFF_FFFF))
        } else {
            self.config.sdmc_path.join(format!(
                "title/{:08x}/{:08x}/content",
                id >> 32,
                id & 0xFFFF_FFFF
            ))
        };

        let tmd_path = match title_db.as_ref().and_then(|db| db.titles.get(&id)) {
            Some(title) => physical_path.join(format!("{:08x}.tmd", title.tmd_content_id)),
            None => {
                warn!("Title {id:016x} does not exist in title.db");
                Self::find_tmd(&physical_path).ok_or(Error::MissingRegion)?
            }
        };

        if is_nand {
            let metadata = fs::metadata(&tmd_path)?;
            if metadata.len() > 1024 * 1024 {
                error!("Could not open {} or file too big", tmd_path.display());
                return Err(Error::OutOfRange);
            }
            TitleMetadata::load(&fs::read(&tmd_path)?, 0)
        } else {
            let relative = format!(
                "/{}",
                tmd_path
                    .strip_prefix(&self.config.sdmc_path)
                    .map_err(|_| Error::MissingRegion)?
                    .to_string_lossy()
                    .replace('\\', "/")
            );
            TitleMetadata::load(&self.sdmc_decryptor.decrypt_file(&relative)?, 0)
        }
    }

    fn open_content(&self, specifier: &ContentSpecifier, content_id: u32) -> Result<ContentFile> {
        if specifier.content_type == ContentType::NandTitle {
            let path = self
                .config
                .system_titles_path
                .as_ref()
                .ok_or(Error::MissingRegion)?
                .join(format!(
                    "{:08x}/{:08x}/content/{:08x}.app",
                    specifier.id >> 32,
                    specifier.id & 0xFFFF_FFFF,
                    content_id
                ));
            Ok(ContentFile::Plain(fs::File::open(path)?))
        } else {
            // For DLCs there is one subfolder every 256 titles, but in
            // practice a hardcoded 00000000 is fine.
            let relative = if (specifier.id >> 32) == DLC_TID_HIGH {
                format!(
                    "/title/{:08x}/{:08x}/content/00000000/{content_id:08x}.app",
                    specifier.id >> 32,
                    specifier.id & 0xFFFF_FFFF
                )
            } else {
                format!(
                    "/title/{:08x}/{:08x}/content/{content_id:08x}.app",
                    specifier.id >> 32,
                    specifier.id & 0xFFFF_FFFF
                )
            };
            Ok(ContentFile::Sdmc(SdmcFile::open(
                &self.config.sdmc_path,
                &relative,
            )?))
        }
    }

    /// Dumps an application's main executable content, decrypted, to a CXI
    /// file. Blocks, but can be aborted from another thread.
    pub fn dump_cxi(
        &mut self,
        specifier: &ContentSpecifier,
        destination: PathBuf,
        callback: &ProgressCallback<'_>,
        auto_filename: bool,
    ) -> Result<()> {
        if specifier.content_type != ContentType::Title || (specifier.id >> 32) != 0x0004_0000 {
            error!("Unsupported specifier (id={:016x})", specifier.id);
            return Err(Error::Unsupported("content type for CXI dump"));
        }

        let tmd = self.load_tmd(specifier.content_type, specifier.id)?;
        let boot_content = tmd.boot_content_id().ok_or(Error::MissingRegion)?;
        let mut ncch = NcchContainer::new(self.open_content(specifier, boot_content)?);

        let destination = if auto_filename || destination.as_os_str().to_string_lossy().ends_with('/') {
            destination.join(format!("{}.cxi", title_file_name(&mut ncch)))
        } else {
            destination
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create path {}", destination.display());
                Error::from(e)
            })?;
        }

        *self.dump_cxi_abort.lock().unwrap() = Some(ncch.abort_handle());
        let result = (|| {
            let mut dest = fs::File::create(&destination)?;
            ncch.decrypt_to_file(&mut dest, callback)
        })();
        *self.dump_cxi_abort.lock().unwrap() = None;

        if result.is_err() {
            let _ = fs::remove_file(&destination);
        }
        result
    }

    pub fn abort_dump_cxi(&self) {
        if let Some(handle) = self.dump_cxi_abort.lock().unwrap().as_ref() {
            handle.abort();
        }
    }

    /// Checks if a content can be built into a legit CIA.
    pub fn can_build_legit_cia(&self, specifier: &ContentSpecifier) -> bool {
        if !specifier.content_type.is_title() {
            return false;
        }
        let Ok(tmd) = self.load_tmd(specifier.content_type, specifier.id) else {
            return false;
        };
        if tmd.verify_hashes().is_err() || tmd.validate_signature().is_err() {
            return false;
        }
        let Some(db) = &self.ticket_db else {
            return false;
        };
        db.tickets
            .get(&tmd.title_id())
            .is_some_and(|ticket| ticket.validate_signature().is_ok())
    }

    /// Builds a CIA from a title. Blocks, but can be aborted from another
    /// thread. No partial archive is left behind on failure.
    pub fn build_cia(
        &mut self,
        mode: BuildMode,
        specifier: &ContentSpecifier,
        destination: PathBuf,
        callback: &ProgressCallback<'_>,
        auto_filename: bool,
    ) -> Result<()> {
        if !cert::is_loaded() {
            error!("Missing certs");
            return Err(Error::MissingRegion);
        }
        if !specifier.content_type.is_title() {
            error!("Unsupported specifier type {:?}", specifier.content_type);
            return Err(Error::Unsupported("content type for CIA build"));
        }

        let tmd = self.load_tmd(specifier.content_type, specifier.id)?;

        let destination = if auto_filename || destination.as_os_str().to_string_lossy().ends_with('/') {
            let boot_content = tmd.boot_content_id().ok_or(Error::MissingRegion)?;
            let mut ncch = NcchContainer::new(self.open_content(specifier, boot_content)?);
            destination.join(format!(
                "{} (v{}).{}",
                title_file_name(&mut ncch),
                tmd.title_version_string(),
                mode.file_extension()
            ))
        } else {
            destination
        };

        let result = self.build_cia_impl(mode, specifier, &destination, tmd, callback);
        self.cia_builder.cleanup();
        if result.is_err() {
            // Remove the borked file
            let _ = fs::remove_file(&destination);
        }
        result
    }

    fn build_cia_impl(
        &mut self,
        mode: BuildMode,
        specifier: &ContentSpecifier,
        destination: &Path,
        tmd: TitleMetadata,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        let chunks: Vec<_> = tmd.chunks.clone();
        self.cia_builder
            .init(mode, destination, tmd, specifier.maximum_size, callback)?;

        for chunk in chunks {
            let file = match self.open_content(specifier, chunk.id()) {
                Ok(file) => file,
                Err(e) => {
                    if chunk.content_type() & content_type_flag::OPTIONAL != 0 {
                        continue;
                    }
                    error!("Could not open content {:08x}", chunk.id());
                    return Err(e);
                }
            };
            let mut ncch = NcchContainer::new(file);
            self.cia_builder.add_content(chunk.id(), &mut ncch, callback)?;
        }

        self.cia_builder.finalize(callback)
    }

    pub fn abort_build_cia(&self) {
        self.cia_builder.abort();
    }

    /// Streams every content of a title through a hash-only sink and
    /// compares against the TMD hashes.
    pub fn check_title_contents(
        &mut self,
        specifier: &ContentSpecifier,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        if !specifier.content_type.is_title() {
            error!("Unsupported specifier type {:?}", specifier.content_type);
            return Err(Error::Unsupported("content type for content check"));
        }

        let tmd = self.load_tmd(specifier.content_type, specifier.id)?;
        let wrapper = ProgressWrapper::new(specifier.maximum_size);

        for chunk in &tmd.chunks {
            let mut file = match self.open_content(specifier, chunk.id()) {
                Ok(file) => file,
                Err(e) => {
                    if chunk.content_type() & content_type_flag::OPTIONAL != 0 {
                        continue;
                    }
                    info!("Could not open content {:08x}", chunk.id());
                    return Err(e);
                }
            };

            let size = file.size()?;
            let mut sink = HashOnlyWriter::new();
            self.file_copier.set_transform(None);
            self.file_copier.reset(size);
            self.file_copier
                .run(&mut file, size, &mut sink, &wrapper.wrap(callback))?;
            if !sink.verify_hash(chunk.hash()) {
                info!("Hash mismatch for content {:08x}", chunk.id());
                return Err(Error::HashMismatch);
            }
        }

        callback(specifier.maximum_size, specifier.maximum_size);
        Ok(())
    }

    /// Gets a list of importable content specifiers.
    pub fn list_content(&self) -> Vec<ContentSpecifier> {
        let mut out = Vec::new();
        self.list_title(&mut out);
        self.list_nand_title(&mut out);
        self.list_nand_savegame(&mut out);
        self.list_extdata(&mut out);
        self.list_sysdata(&mut out);
        out
    }

    fn each_hex_subdir(path: &Path, mut f: impl FnMut(u64, PathBuf)) {
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_hex_id(&name, 8) {
                continue;
            }
            let Ok(low) = u64::from_str_radix(&name, 16) else {
                continue;
            };
            f(low, entry.path());
        }
    }

    fn list_title(&self, out: &mut Vec<ContentSpecifier>) {
        for high_id in SDMC_TITLE_HIGH_IDS {
            let base = self.config.sdmc_path.join(format!("title/{high_id:08x}"));
            Self::each_hex_subdir(&base, |low, dir| {
                let id = (high_id << 32) | low;
                let citra_path = self
                    .sdmc_citra_root()
                    .join(format!("title/{high_id:08x}/{low:08x}"));

                if dir.join("content").exists() {
                    out.push(self.title_specifier(ContentType::Title, id, &dir, &citra_path));
                }

                // Check savegames only for applications; they can also be
                // uninitialized, which only the decryption reveals.
                if high_id == 0x0004_0000 && dir.join("data").exists() {
                    let save_path =
                        format!("/title/{high_id:08x}/{low:08x}/data/00000001.sav");
                    let good = self
                        .sdmc_decryptor
                        .decrypt_file(&save_path)
                        .ok()
                        .and_then(|data| DataContainer::new(data).ok())
                        .is_some();
                    if good {
                        out.push(ContentSpecifier {
                            content_type: ContentType::Savegame,
                            id,
                            already_exists: citra_path.join("data").exists(),
                            maximum_size: directory_tree_size(&dir.join("data")),
                            ..Default::default()
                        });
                    }
                }
            });
        }
    }

    fn title_specifier(
        &self,
        content_type: ContentType,
        id: u64,
        dir: &Path,
        citra_path: &Path,
    ) -> ContentSpecifier {
        let already_exists = citra_path.join("content").exists();
        let maximum_size = directory_tree_size(&dir.join("content")) + TITLE_SIZE_ALLOWANCE;

        let fallback = ContentSpecifier {
            content_type,
            id,
            already_exists,
            maximum_size,
            ..Default::default()
        };

        let Ok(tmd) = self.load_tmd(content_type, id) else {
            return fallback;
        };
        let Some(boot_content) = tmd.boot_content_id() else {
            return fallback;
        };
        let specifier = ContentSpecifier {
            content_type,
            id,
            ..fallback.clone()
        };
        let Ok(file) = self.open_content(&specifier, boot_content) else {
            return fallback;
        };
        let mut ncch = NcchContainer::new(file);
        if ncch.load().is_err() {
            warn!("Could not load NCCH for {id:016x}");
            return fallback;
        }

        let data = load_title_data(&mut ncch);
        ContentSpecifier {
            content_type,
            id,
            already_exists,
            maximum_size,
            name: data.name,
            extdata_id: data.extdata_id,
            icon: data.icon,
        }
    }

    fn list_nand_title(&self, out: &mut Vec<ContentSpecifier>) {
        let Some(system_titles) = &self.config.system_titles_path else {
            return;
        };
        for high_id in NAND_TITLE_HIGH_IDS {
            let base = system_titles.join(format!("{high_id:08x}"));
            Self::each_hex_subdir(&base, |low, dir| {
                let id = (high_id << 32) | low;
                if !dir.join("content").exists() {
                    return;
                }
                let citra_path = self
                    .nand_citra_root()
                    .join(ZEROS_32)
                    .join(format!("title/{high_id:08x}/{low:08x}"));
                out.push(self.title_specifier(ContentType::NandTitle, id, &dir, &citra_path));
            });
        }
    }

    fn list_nand_savegame(&self, out: &mut Vec<ContentSpecifier>) {
        let Some(nand_data) = &self.config.nand_data_path else {
            return;
        };
        Self::each_hex_subdir(&nand_data.join("sysdata"), |id, dir| {
            let path = dir.join("00000000");
            // Read the file to test.
            let Ok(data) = fs::read(&path) else {
                error!("Could not read from {}", path.display());
                return;
            };
            if DataContainer::new(data).is_err() {
                return;
            }

            let citra_path = self
                .nand_citra_root()
                .join("data")
                .join(ZEROS_32)
                .join(format!("sysdata/{id:08x}/00000000"));
            out.push(ContentSpecifier {
                content_type: ContentType::NandSavegame,
                id,
                already_exists: citra_path.exists(),
                maximum_size: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
                ..Default::default()
            });
        });
    }

    fn list_extdata(&self, out: &mut Vec<ContentSpecifier>) {
        Self::each_hex_subdir(
            &self.config.sdmc_path.join("extdata/00000000"),
            |id, dir| {
                let citra_path = self
                    .sdmc_citra_root()
                    .join(format!("extdata/00000000/{id:08x}"));
                out.push(ContentSpecifier {
                    content_type: ContentType::Extdata,
                    id,
                    already_exists: citra_path.exists(),
                    maximum_size: directory_tree_size(&dir),
                    ..Default::default()
                });
            },
        );
        if let Some(nand_data) = &self.config.nand_data_path {
            Self::each_hex_subdir(&nand_data.join("extdata/00048000"), |id, dir| {
                let citra_path = self
                    .nand_citra_root()
                    .join("data")
                    .join(ZEROS_32)
                    .join(format!("extdata/00048000/{id:08x}"));
                out.push(ContentSpecifier {
                    content_type: ContentType::NandExtdata,
                    id: (0x0004_8000u64 << 32) | id,
                    already_exists: citra_path.exists(),
                    maximum_size: directory_tree_size(&dir),
                    ..Default::default()
                });
            });
        }
    }

    fn list_sysdata(&self, out: &mut Vec<ContentSpecifier>) {
        let sysdata_path = self.sysdata_path();

        let mut check_content = |id: u64, source: Option<&PathBuf>, name: &str| {
            if let Some(source) = source {
                out.push(ContentSpecifier {
                    content_type: ContentType::Sysdata,
                    id,
                    already_exists: sysdata_path.join(name).exists(),
                    maximum_size: fs::metadata(source).map(|m| m.len()).unwrap_or(0),
                    name: name.to_string(),
                    ..Default::default()
                });
            }
        };

        let bootrom = self.config.bootrom_path.clone();
        check_content(0, Some(&bootrom), BOOTROM9);
        check_content(2, self.config.secret_sector_path.as_ref(), SECRET_SECTOR);

        // aes_keys.txt can always be generated once the bootrom is loaded
        {
            let target = sysdata_path.join(AES_KEYS);
            let exists = fs::metadata(&target).map(|m| m.len() >= 46 * 3).unwrap_or(false);
            out.push(ContentSpecifier {
                content_type: ContentType::Sysdata,
                id: 3,
                already_exists: exists,
                maximum_size: 47 * 3,
                name: AES_KEYS.to_string(),
                ..Default::default()
            });
        }

        // seeddb is "already imported" when no new seeds would be added
        let Some(seed_db_path) = &self.config.seed_db_path else {
            return;
        };
        let Ok(target) = SeedDb::load(&sysdata_path.join(SEED_DB)) else {
            return;
        };
        let Ok(source) = SeedDb::load(seed_db_path) else {
            return;
        };
        let exists = source.seeds.iter().all(|seed| target.get(seed.title_id).is_some());
        out.push(ContentSpecifier {
            content_type: ContentType::Sysdata,
            id: 1,
            already_exists: exists,
            maximum_size: fs::metadata(seed_db_path).map(|m| m.len()).unwrap_or(0),
            name: SEED_DB.to_string(),
            ..Default::default()
        });
    }

    fn delete_content(&self, specifier: &ContentSpecifier) {
        match specifier.content_type {
            ContentType::Title => self.delete_title(specifier.id),
            ContentType::Savegame => self.delete_savegame(specifier.id),
            ContentType::NandSavegame => self.delete_nand_savegame(specifier.id),
            ContentType::Extdata => self.delete_extdata(specifier.id),
            ContentType::NandExtdata => self.delete_nand_extdata(specifier.id),
            ContentType::Sysdata => self.delete_sysdata(specifier.id),
            ContentType::NandTitle => self.delete_nand_title(specifier.id),
        }
    }

    fn delete_title(&self, id: u64) {
        let _ = fs::remove_dir_all(self.sdmc_citra_root().join(format!(
            "title/{:08x}/{:08x}/content",
            id >> 32,
            id & 0xFFFF_FFFF
        )));
    }

    fn delete_nand_title(&self, id: u64) {
        let _ = fs::remove_dir_all(self.nand_citra_root().join(ZEROS_32).join(format!(
            "title/{:08x}/{:08x}/content",
            id >> 32,
            id & 0xFFFF_FFFF
        )));
    }

    fn delete_savegame(&self, id: u64) {
        let _ = fs::remove_dir_all(self.sdmc_citra_root().join(format!(
            "title/{:08x}/{:08x}/data",
            id >> 32,
            id & 0xFFFF_FFFF
        )));
    }

    fn delete_nand_savegame(&self, id: u64) {
        let _ = fs::remove_dir_all(
            self.nand_citra_root()
                .join("data")
                .join(ZEROS_32)
                .join(format!("sysdata/{:08x}", id & 0xFFFF_FFFF)),
        );
    }

    fn delete_extdata(&self, id: u64) {
        let _ = fs::remove_dir_all(self.sdmc_citra_root().join(format!(
            "extdata/{:08x}/{:08x}",
            id >> 32,
            id & 0xFFFF_FFFF
        )));
    }

    fn delete_nand_extdata(&self, id: u64) {
        let _ = fs::remove_dir_all(
            self.nand_citra_root()
                .join("data")
                .join(ZEROS_32)
                .join(format!("extdata/{:08x}/{:08x}", id >> 32, id & 0xFFFF_FFFF)),
        );
    }

    // Each id deletes only its own file.
    fn delete_sysdata(&self, id: u64) {
        let name = match id {
            0 => BOOTROM9,
            1 => SEED_DB,
            2 => SECRET_SECTOR,
            3 => AES_KEYS,
            _ => {
                error!("Unexpected sysdata id {id}");
                return;
            }
        };
        let _ = fs::remove_file(self.sysdata_path().join(name));
    }
}

impl Drop for Importer {
    fn drop(&mut self) {
        // Unload the process-wide databases
        cert::clear();
        seeddb::clear_global();
    }
}

/// Looks for preset configs on an SD card mounted at `mount_point`: one per
/// ID0/ID1 pair, with dumper support files when present.
pub fn load_preset_config(mount_point: &Path, user_path: &Path) -> Vec<Config> {
    // Not a console SD card at all
    if !mount_point.join("Nintendo 3DS").exists() {
        return Vec::new();
    }

    let mut template = Config {
        user_path: user_path.to_path_buf(),
        ..Config::default()
    };

    // Load dumped data paths if using our dumper
    let dumper_root = mount_point.join(DUMPER_DIR);
    if dumper_root.exists() {
        let mut load_path = |out: &mut Option<PathBuf>, name: &str| {
            let path = dumper_root.join(name);
            if path.exists() {
                *out = Some(path);
            }
        };

        let movable = dumper_root.join(MOVABLE_SED);
        if movable.exists() {
            template.movable_sed_path = movable;
        }
        let bootrom = dumper_root.join(BOOTROM9);
        if bootrom.exists() {
            template.bootrom_path = bootrom;
        }
        load_path(&mut template.certs_db_path, CERTS_DB);
        load_path(&mut template.nand_title_db_path, TITLE_DB);
        load_path(&mut template.ticket_db_path, TICKET_DB);
        load_path(&mut template.seed_db_path, SEED_DB);
        load_path(&mut template.secret_sector_path, SECRET_SECTOR);
        load_path(&mut template.system_titles_path, "title");
        load_path(&mut template.nand_data_path, "data");

        let enc_title_keys = mount_point.join("gm9/support").join(ENC_TITLE_KEYS_BIN);
        if enc_title_keys.exists() {
            template.enc_title_keys_bin_path = Some(enc_title_keys);
        }

        if let Ok(version) = fs::read_to_string(dumper_root.join("version.txt")) {
            template.version = version.trim().parse().unwrap_or(0);
        }
    }

    let mut out = Vec::new();
    let Ok(id0_entries) = fs::read_dir(mount_point.join("Nintendo 3DS")) else {
        return out;
    };
    for id0 in id0_entries.flatten() {
        if !id0.path().is_dir() || !is_hex_id(&id0.file_name().to_string_lossy(), 32) {
            continue;
        }
        let Ok(id1_entries) = fs::read_dir(id0.path()) else {
            continue;
        };
        for id1 in id1_entries.flatten() {
            if !id1.path().is_dir() || !is_hex_id(&id1.file_name().to_string_lossy(), 32) {
                continue;
            }
            let mut config = template.clone();
            config.sdmc_path = id1.path();
            out.push(config);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests::wrap_in_disa;
    use crate::copier::no_progress;
    use crate::crypto;
    use crate::inner_fat::tests::{build_image, SAVE_LAYOUT};

    fn write_synthetic_bootrom(path: &Path) {
        // A zero-filled 64 KiB image loads fine: every slot just ends up
        // with zero keys.
        fs::write(path, vec![0u8; 65536]).unwrap();
    }

    fn write_movable_sed(path: &Path, key: &[u8; 0x10]) {
        let mut image = vec![0u8; 0x140];
        image[0x118..0x128].copy_from_slice(key);
        fs::write(path, image).unwrap();
    }

    fn base_config(root: &Path) -> Config {
        let sdmc = root.join("sdmc");
        let user = root.join("user");
        fs::create_dir_all(&sdmc).unwrap();
        fs::create_dir_all(&user).unwrap();

        let bootrom = root.join(BOOTROM9);
        write_synthetic_bootrom(&bootrom);
        let movable = root.join(MOVABLE_SED);
        write_movable_sed(&movable, &[0x44; 0x10]);

        Config {
            sdmc_path: sdmc,
            user_path: user,
            movable_sed_path: movable,
            bootrom_path: bootrom,
            ..Config::default()
        }
    }

    #[test]
    fn importer_requires_sd_key() {
        let _guard = key::tests::lock();
        key::clear_keys();

        let root = tempfile::tempdir().unwrap();
        let config = base_config(root.path());
        // The synthetic bootrom has no KeyX for the SD slot, so the normal
        // key cannot be derived.
        assert!(matches!(
            Importer::new(config),
            Err(Error::MissingKey(slot::SD))
        ));
        key::clear_keys();
    }

    /// Builds an importer without going through `new`, so the test can
    /// inject the SD slot KeyX directly instead of deriving it from
    /// console dumps.
    fn working_importer(root: &Path) -> Importer {
        let config = base_config(root);
        key::clear_keys();
        key::load_movable_sed_keys(&config.movable_sed_path).unwrap();
        key::set_key_x(slot::SD, [0x55; 0x10]);
        assert!(key::is_normal_key_available(slot::SD));

        let sdmc_decryptor = SdmcDecryptor::new(config.sdmc_path.clone()).unwrap();
        Importer {
            config,
            sdmc_decryptor,
            file_copier: FileCopier::new(),
            cia_builder: CiaBuilder::new(None, None),
            ticket_db: None,
            sdmc_title_db: None,
            nand_title_db: None,
            dump_cxi_abort: Mutex::new(None),
        }
    }

    #[test]
    fn import_and_delete_nand_savegame() {
        let _guard = key::tests::lock();
        let root = tempfile::tempdir().unwrap();
        let mut importer = working_importer(root.path());

        // NAND data tree with one system savegame.
        let nand_data = root.path().join("nand_data");
        let save_image = build_image(&SAVE_LAYOUT, &[], &[("cfg", b"sysconf")], 0x200);
        let save_dir = nand_data.join("sysdata/00010017");
        fs::create_dir_all(&save_dir).unwrap();
        fs::write(save_dir.join("00000000"), wrap_in_disa(&save_image)).unwrap();
        importer.config.nand_data_path = Some(nand_data);

        let specifier = ContentSpecifier {
            content_type: ContentType::NandSavegame,
            id: 0x00010017,
            ..Default::default()
        };
        importer.import_content(&specifier, no_progress()).unwrap();

        let extracted = importer
            .nand_citra_root()
            .join("data")
            .join(ZEROS_32)
            .join("sysdata/00010017/00000000/cfg");
        assert_eq!(fs::read(&extracted).unwrap(), b"sysconf");

        // Listing reports it as already existing now.
        let mut listed = Vec::new();
        importer.list_nand_savegame(&mut listed);
        assert_eq!(listed.len(), 1);
        assert!(listed[0].already_exists);

        importer.delete_content(&specifier);
        assert!(!extracted.exists());
        key::clear_keys();
    }

    #[test]
    fn import_sd_savegame_decrypts_from_sd_tree() {
        let _guard = key::tests::lock();
        let root = tempfile::tempdir().unwrap();
        let mut importer = working_importer(root.path());
        let sd_key = key::normal_key(slot::SD).unwrap();

        let save_image = build_image(&SAVE_LAYOUT, &[], &[("game.sav", b"progress!")], 0x200);
        let wrapped = wrap_in_disa(&save_image);

        let rel = "/title/00040000/00112233/data/00000001.sav";
        let ctr = crypto::file_ctr(rel);
        let mut encrypted = wrapped;
        crypto::ctr_crypt(&sd_key, &ctr, &mut encrypted);
        let physical = importer
            .config
            .sdmc_path
            .join("title/00040000/00112233/data/00000001.sav");
        fs::create_dir_all(physical.parent().unwrap()).unwrap();
        fs::write(physical, encrypted).unwrap();

        let specifier = ContentSpecifier {
            content_type: ContentType::Savegame,
            id: 0x0004_0000_0011_2233,
            ..Default::default()
        };
        importer.import_content(&specifier, no_progress()).unwrap();

        let extracted = importer
            .sdmc_citra_root()
            .join("title/00040000/00112233/data/00000001/game.sav");
        assert_eq!(fs::read(extracted).unwrap(), b"progress!");

        let metadata = importer
            .sdmc_citra_root()
            .join("title/00040000/00112233/data/00000001.metadata");
        assert!(metadata.exists());
        key::clear_keys();
    }

    #[test]
    fn import_title_decrypts_contents() {
        let _guard = key::tests::lock();
        let root = tempfile::tempdir().unwrap();
        let mut importer = working_importer(root.path());
        let sd_key = key::normal_key(slot::SD).unwrap();

        let payload: Vec<u8> = (0..0x3000u32).map(|v| v as u8).collect();
        let rel = "/title/00040000/00001000/content/00000000.app";
        let ctr = crypto::file_ctr(rel);
        let mut encrypted = payload.clone();
        crypto::ctr_crypt(&sd_key, &ctr, &mut encrypted);

        let physical = importer
            .config
            .sdmc_path
            .join("title/00040000/00001000/content/00000000.app");
        fs::create_dir_all(physical.parent().unwrap()).unwrap();
        fs::write(physical, encrypted).unwrap();
        // cmd directories are skipped
        fs::create_dir_all(
            importer
                .config
                .sdmc_path
                .join("title/00040000/00001000/content/cmd"),
        )
        .unwrap();

        let specifier = ContentSpecifier {
            content_type: ContentType::Title,
            id: 0x0004_0000_0000_1000,
            maximum_size: payload.len() as u64,
            ..Default::default()
        };
        importer.import_content(&specifier, no_progress()).unwrap();

        let imported = importer
            .sdmc_citra_root()
            .join("title/00040000/00001000/content/00000000.app");
        assert_eq!(fs::read(imported).unwrap(), payload);
        key::clear_keys();
    }

    #[test]
    fn failed_import_cleans_up_target() {
        let _guard = key::tests::lock();
        let root = tempfile::tempdir().unwrap();
        let mut importer = working_importer(root.path());

        // A savegame whose decrypted container is garbage.
        let physical = importer
            .config
            .sdmc_path
            .join("title/00040000/99999999/data/00000001.sav");
        fs::create_dir_all(physical.parent().unwrap()).unwrap();
        fs::write(physical, vec![0u8; 0x400]).unwrap();

        // Pre-create the target directory as if a previous import partially
        // succeeded.
        let target = importer
            .sdmc_citra_root()
            .join("title/00040000/99999999/data");
        fs::create_dir_all(&target).unwrap();

        let specifier = ContentSpecifier {
            content_type: ContentType::Savegame,
            id: 0x0004_0000_9999_9999,
            ..Default::default()
        };
        assert!(importer.import_content(&specifier, no_progress()).is_err());
        assert!(!target.exists());
        key::clear_keys();
    }

    #[test]
    fn sysdata_roundtrip_and_scoped_delete() {
        let _guard = key::tests::lock();
        let root = tempfile::tempdir().unwrap();
        let mut importer = working_importer(root.path());

        // Merge-import the seed database.
        let mut source_db = SeedDb::default();
        source_db.add(crate::seeddb::Seed::new(0xAAAA, [1; 0x10]));
        let seed_path = root.path().join("source_seeddb.bin");
        source_db.save(&seed_path).unwrap();
        importer.config.seed_db_path = Some(seed_path);

        importer
            .import_content(
                &ContentSpecifier {
                    content_type: ContentType::Sysdata,
                    id: 1,
                    ..Default::default()
                },
                no_progress(),
            )
            .unwrap();
        let merged = SeedDb::load(&importer.sysdata_path().join(SEED_DB)).unwrap();
        assert_eq!(merged.get(0xAAAA), Some([1; 0x10]));

        // Import the bootrom too, then delete only the seed db.
        importer
            .import_content(
                &ContentSpecifier {
                    content_type: ContentType::Sysdata,
                    id: 0,
                    ..Default::default()
                },
                no_progress(),
            )
            .unwrap();
        assert!(importer.sysdata_path().join(BOOTROM9).exists());

        importer.delete_sysdata(1);
        assert!(!importer.sysdata_path().join(SEED_DB).exists());
        assert!(importer.sysdata_path().join(BOOTROM9).exists());
        key::clear_keys();
    }

    #[test]
    fn preset_config_discovers_id_pairs() {
        let mount = tempfile::tempdir().unwrap();
        let id0 = "0123456789abcdef0123456789abcdef";
        let id1 = "fedcba9876543210fedcba9876543210";
        fs::create_dir_all(mount.path().join("Nintendo 3DS").join(id0).join(id1)).unwrap();

        let dumper = mount.path().join(DUMPER_DIR);
        fs::create_dir_all(&dumper).unwrap();
        fs::write(dumper.join(BOOTROM9), b"x").unwrap();
        fs::write(dumper.join(MOVABLE_SED), b"x").unwrap();
        fs::write(dumper.join(SEED_DB), b"x").unwrap();
        fs::write(dumper.join("version.txt"), b"4\n").unwrap();

        let user = mount.path().join("user");
        let configs = load_preset_config(mount.path(), &user);
        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert!(config.sdmc_path.ends_with(id1));
        assert_eq!(config.version, CURRENT_DUMPER_VERSION);
        assert!(config.seed_db_path.is_some());
        assert!(config.bootrom_path.ends_with(BOOTROM9));

        // Not an SD card: no configs.
        let other = tempfile::tempdir().unwrap();
        assert!(load_preset_config(other.path(), &user).is_empty());
    }
}
