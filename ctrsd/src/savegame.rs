use std::fs;
use std::path::Path;

use crate::inner_fat::{ArchiveFormatInfo, DirectoryEntry, FatLayout, FileEntry, InnerFat};
use crate::Result;

const SAVE_LAYOUT: FatLayout = FatLayout {
    preheader_size: 0,
    magic: *b"SAVE",
    version: 0x40000,
};

/// A savegame image: an inner FAT over one (duplicate-data) or two
/// partitions of a DISA container.
pub struct Savegame {
    fat: InnerFat<DirectoryEntry, FileEntry>,
}

impl Savegame {
    pub fn new(partitions: Vec<Vec<u8>>) -> Result<Self> {
        Ok(Self {
            fat: InnerFat::new(partitions, &SAVE_LAYOUT)?,
        })
    }

    fn extract_file(&self, dir: &Path, index: usize) -> Result<()> {
        use crate::inner_fat::FileEntryRecord;
        let name = self.fat.file_entry_table[index].name();
        fs::write(dir.join(name), self.fat.file_data(index)?)?;
        Ok(())
    }

    /// Recursively extracts the index-th directory to `path`.
    pub fn extract_directory(&self, path: &Path, index: usize) -> Result<()> {
        self.fat
            .visit_directory(path, index, &mut |dir, file_index| {
                self.extract_file(dir, file_index)
            })
    }

    /// Extracts the whole savegame into `path`, mirroring the console
    /// layout (all saves on a physical console are called 00000001) and
    /// writing the archive metadata next to it.
    pub fn extract(&self, path: &Path) -> Result<()> {
        // Directory 1 is the root
        self.extract_directory(&path.join("00000001"), 1)?;
        self.format_info().write_to(&path.join("00000001.metadata"))?;
        Ok(())
    }

    pub(crate) fn format_info(&self) -> ArchiveFormatInfo {
        // The total_size reported by a physical console differs between the
        // archive variants it is queried through; 0x40000 matches the user
        // save data path.
        ArchiveFormatInfo::new(
            0x40000,
            self.fat.fs_info().maximum_directory_count,
            self.fat.fs_info().maximum_file_count,
            self.fat.duplicate_data(),
        )
    }
}
