use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::container::DataContainer;
use crate::inner_fat::{FatLayout, InnerFat, TitleDbDirectoryEntry, TitleDbFileEntry};
use crate::ticket::Ticket;
use crate::{Error, Layout, Result};

use log::error;
use static_assertions::assert_eq_size;

const BDRI_LAYOUT: FatLayout = FatLayout {
    preheader_size: 0x80,
    magic: *b"BDRI",
    version: 0x30000,
};

const TICKET_LAYOUT: FatLayout = FatLayout {
    preheader_size: 0x10,
    magic: *b"BDRI",
    version: 0x30000,
};

type DbFat = InnerFat<TitleDbDirectoryEntry, TitleDbFileEntry>;

/// Installed-title record stored in title.db.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct TitleInfoEntry {
    pub title_size: u64,
    pub title_type: u32,
    pub title_version: u32,
    pub flags0: u32,
    pub tmd_content_id: u32,
    pub cmd_content_id: u32,
    pub flags1: u32,
    pub extdata_id_low: u32,
    _pad0: [u8; 4],
    pub flags2: u64,
    pub product_code: [u8; 0x10],
    _pad1: [u8; 0x40],
}
assert_eq_size!([u8; 0x80], TitleInfoEntry);
unsafe impl Layout for TitleInfoEntry {}

fn visit_title_files(
    fat: &DbFat,
    mut load: impl FnMut(&DbFat, usize, u64) -> Result<()>,
) -> Result<()> {
    // Walk the root directory's file chain; each file is one record.
    let root = fat
        .directory_entry_table
        .get(1)
        .ok_or(Error::OutOfRange)?;
    let mut cur = root.first_file_index as usize;
    while cur != 0 {
        let entry = fat.file_entry_table.get(cur).ok_or(Error::OutOfRange)?;
        let title_id = entry.title_id;
        load(fat, cur, title_id)?;
        cur = entry.next_sibling_index as usize;
    }
    Ok(())
}

/// The NAND/SD title database: title-ID-keyed records inside an inner FAT
/// with a "NANDTDB"/"TEMPTDB" pre-header.
pub struct TitleDb {
    pub titles: HashMap<u64, TitleInfoEntry>,
}

impl TitleDb {
    /// Loads from the decrypted level-4 image of a title.db container.
    pub fn from_data(data: Vec<u8>) -> Result<Self> {
        let fat = DbFat::new(vec![data], &BDRI_LAYOUT)?;

        let preheader_magic: [u8; 8] = fat.preheader[..8].try_into().unwrap();
        if &preheader_magic != b"NANDTDB\0" && &preheader_magic != b"TEMPTDB\0" {
            error!("File is invalid, decryption errors may have happened.");
            return Err(Error::InvalidMagic);
        }

        let mut titles = HashMap::new();
        visit_title_files(&fat, |fat, index, title_id| {
            let data = fat.file_data(index)?;
            if data.len() != core::mem::size_of::<TitleInfoEntry>() {
                error!("Entry {index} has incorrect size");
            }
            let title = TitleInfoEntry::read_from(&data, 0)?;
            titles.insert(title_id, title);
            Ok(())
        })?;
        Ok(Self { titles })
    }

    /// Loads from a title.db file (outer container included).
    pub fn from_file(path: &Path) -> Result<Self> {
        let container = DataContainer::new(fs::read(path)?)?;
        let mut data = container.ivfc_level4_data()?;
        Self::from_data(data.swap_remove(0))
    }
}

/// The console's ticket database, keyed by title ID.
pub struct TicketDb {
    pub tickets: HashMap<u64, Ticket>,
}

impl TicketDb {
    pub fn from_data(data: Vec<u8>) -> Result<Self> {
        let fat = DbFat::new(vec![data], &TICKET_LAYOUT)?;

        let preheader_magic: [u8; 4] = fat.preheader[..4].try_into().unwrap();
        if &preheader_magic != b"TICK" {
            error!("File is invalid, decryption errors may have happened.");
            return Err(Error::InvalidMagic);
        }

        let mut tickets = HashMap::new();
        visit_title_files(&fat, |fat, index, title_id| {
            let data = fat.file_data(index)?;
            // Each record carries an 8-byte header before the ticket.
            let ticket = Ticket::load(&data, 8)?;
            tickets.insert(title_id, ticket);
            Ok(())
        })?;
        Ok(Self { tickets })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let container = DataContainer::new(fs::read(path)?)?;
        let mut data = container.ivfc_level4_data()?;
        Self::from_data(data.swap_remove(0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inner_fat::{FatHeader, FatNode, FatWord, FileSystemInformation};
    use crate::ticket::build_fake_ticket;

    /// Builds a title-DB-shaped FAT image holding the given records, each
    /// as a single-block file keyed by title ID.
    pub(crate) fn build_db_image(
        layout: &FatLayout,
        preheader_magic: &[u8],
        records: &[(u64, Vec<u8>)],
    ) -> Vec<u8> {
        let bs = 0x200usize;
        let mut preheader = vec![0u8; layout.preheader_size];
        preheader[..preheader_magic.len()].copy_from_slice(preheader_magic);

        let dir_count = 1u32;
        let file_count = records.len() as u32;

        let mut dir_table = vec![0u8; (dir_count as usize + 2) * 0x20];
        let root = TitleDbDirectoryEntry {
            parent_directory_index: 0,
            next_sibling_index: 0,
            first_subdirectory_index: 0,
            first_file_index: if records.is_empty() { 0 } else { 1 },
            _pad0: [0; 12],
            next_hash_bucket_entry: 0,
        };
        dir_table[0x20..0x40].copy_from_slice(root.as_bytes());

        let mut file_table = vec![0u8; (file_count as usize + 1) * 0x2C];
        let mut data = Vec::new();
        let mut fat_nodes = vec![FatNode { u: FatWord::new(), v: FatWord::new() }];

        let mut next_block = 2u32;
        for (i, (title_id, contents)) in records.iter().enumerate() {
            let blocks = contents.len().div_ceil(bs).max(1) as u32;
            let first_block = next_block;
            next_block += blocks;

            let entry = TitleDbFileEntry {
                parent_directory_index: 1,
                title_id: *title_id,
                next_sibling_index: if i + 1 < records.len() { i as u32 + 2 } else { 0 },
                _pad0: [0; 4],
                data_block_index: first_block,
                file_size: contents.len() as u64,
                _pad1: [0; 8],
                next_hash_bucket_entry: 0,
            };
            file_table[(i + 1) * 0x2C..(i + 2) * 0x2C].copy_from_slice(entry.as_bytes());

            let mut padded = contents.clone();
            padded.resize(blocks as usize * bs, 0);
            data.extend_from_slice(&padded);

            while fat_nodes.len() < (first_block + blocks) as usize + 1 {
                fat_nodes.push(FatNode { u: FatWord::new(), v: FatWord::new() });
            }
            if blocks > 1 {
                fat_nodes[first_block as usize + 1] = FatNode {
                    u: FatWord::new().with_flag(true),
                    v: FatWord::new(),
                };
                fat_nodes[first_block as usize + 2] = FatNode {
                    u: FatWord::new(),
                    v: FatWord::new().with_index(first_block + blocks),
                };
            }
        }

        let fat_len = fat_nodes.len() * 8;
        let data_region_offset = 0x88u64 + fat_len as u64;
        let data_block_count = next_block;

        let mut region = vec![0u8; data_block_count as usize * bs];
        region[..dir_table.len()].copy_from_slice(&dir_table);
        region[bs..bs + file_table.len()].copy_from_slice(&file_table);
        region[2 * bs..2 * bs + data.len()].copy_from_slice(&data);

        let fat_header = FatHeader {
            magic: layout.magic,
            version: layout.version,
            filesystem_information_offset: 0x20,
            image_size: 0,
            image_block_size: bs as u32,
            _pad0: [0; 4],
        };
        let mut fs_info = FileSystemInformation::zeroed();
        fs_info.data_region_block_size = bs as u32;
        fs_info.file_allocation_table_offset = 0x88;
        fs_info.file_allocation_table_entry_count = fat_nodes.len() as u32;
        fs_info.data_region_offset = data_region_offset;
        fs_info.data_region_block_count = data_block_count;
        fs_info.directory_entry_table = crate::inner_fat::TableOffset::new_duplicate(0);
        fs_info.maximum_directory_count = dir_count;
        fs_info.file_entry_table = crate::inner_fat::TableOffset::new_duplicate(1);
        fs_info.maximum_file_count = file_count;

        let mut image = Vec::new();
        image.extend_from_slice(&preheader);
        image.extend_from_slice(fat_header.as_bytes());
        image.extend_from_slice(fs_info.as_bytes());
        for node in &fat_nodes {
            image.extend_from_slice(node.as_bytes());
        }
        image.extend_from_slice(&region);
        image
    }

    #[test]
    fn title_db_parses_records() {
        let mut record = vec![0u8; 0x80];
        // title_size and tmd_content_id fields
        record[..8].copy_from_slice(&0x4000u64.to_le_bytes());
        record[16..20].copy_from_slice(&0x0000_0002u32.to_le_bytes());

        let image = build_db_image(&BDRI_LAYOUT, b"NANDTDB\0", &[(0x1122, record)]);
        let db = TitleDb::from_data(image).unwrap();
        assert_eq!(db.titles.len(), 1);
        let entry = &db.titles[&0x1122];
        assert_eq!(entry.title_size, 0x4000);
        assert_eq!(entry.tmd_content_id, 2);
    }

    #[test]
    fn title_db_rejects_wrong_preheader_magic() {
        let image = build_db_image(&BDRI_LAYOUT, b"WHATEVER", &[]);
        assert!(TitleDb::from_data(image).is_err());
    }

    #[test]
    fn ticket_db_parses_tickets() {
        let ticket = build_fake_ticket(0xAABB_CCDD_0011_2233);
        let mut blob = vec![0u8; 8];
        ticket.save(&mut blob).unwrap();

        let image = build_db_image(&TICKET_LAYOUT, b"TICK", &[(0xAABB_CCDD_0011_2233, blob)]);
        let db = TicketDb::from_data(image).unwrap();
        assert_eq!(db.tickets.len(), 1);
        assert_eq!(
            db.tickets[&0xAABB_CCDD_0011_2233].body.title_id(),
            0xAABB_CCDD_0011_2233
        );
    }
}
