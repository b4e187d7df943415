use std::fs;
use std::path::{Path, PathBuf};

use crate::container::DataContainer;
use crate::inner_fat::{ArchiveFormatInfo, DirectoryEntry, FatLayout, FileEntry, InnerFat};
use crate::sdmc::SdmcDecryptor;
use crate::{Error, Result};

use log::warn;

const VSXE_LAYOUT: FatLayout = FatLayout {
    preheader_size: 0,
    magic: *b"VSXE",
    version: 0x30000,
};

/// Maximum amount of device files a device directory can hold.
const DEVICE_DIR_CAPACITY: u32 = 126;

/// Where extdata device files are read from: the encrypted SD tree, or a
/// plain NAND dump directory.
pub enum ExtdataSource<'a> {
    Sdmc {
        /// Path of the extdata folder relative to the decryptor root,
        /// starting and ending with "/".
        data_path: String,
        decryptor: &'a SdmcDecryptor,
    },
    Plain(PathBuf),
}

impl ExtdataSource<'_> {
    fn read_file(&self, relative: &str) -> Option<Vec<u8>> {
        match self {
            Self::Sdmc {
                data_path,
                decryptor,
            } => decryptor
                .decrypt_file(&format!("{data_path}{relative}"))
                .ok(),
            Self::Plain(root) => fs::read(root.join(relative)).ok(),
        }
    }
}

/// Extdata: an inner FAT whose file bodies are not in the FAT payload but
/// sharded across device files on the source filesystem, each wrapped in
/// its own DIFF container.
pub struct Extdata<'a> {
    fat: InnerFat<DirectoryEntry, FileEntry>,
    source: ExtdataSource<'a>,
}

impl<'a> Extdata<'a> {
    pub fn new(source: ExtdataSource<'a>) -> Result<Self> {
        // The VSXE metadata file is always device file 00000000/00000001.
        let vsxe_raw = source.read_file("00000000/00000001").ok_or_else(|| {
            log::error!("Failed to load or decrypt VSXE");
            Error::MissingRegion
        })?;
        let container = DataContainer::new(vsxe_raw)?;
        let mut data = container.ivfc_level4_data()?;

        Ok(Self {
            fat: InnerFat::new(vec![data.swap_remove(0)], &VSXE_LAYOUT)?,
            source,
        })
    }

    fn extract_file(&self, dir: &Path, index: usize) -> Result<()> {
        use crate::inner_fat::FileEntryRecord;
        let name = self.fat.file_entry_table[index].name();

        // Device file IDs are 1-based relative to the file entry index.
        let file_index = index as u32 + 1;
        let sub_directory_id = file_index / DEVICE_DIR_CAPACITY;
        let sub_file_id = file_index % DEVICE_DIR_CAPACITY;
        let device_file_path = format!("{sub_directory_id:08x}/{sub_file_id:08x}");

        let Some(container_data) = self.source.read_file(&device_file_path) else {
            // File does not exist?
            warn!("Ignoring file {device_file_path}");
            return Ok(());
        };

        let container = DataContainer::new(container_data)?;
        let mut data = container.ivfc_level4_data()?;
        fs::write(dir.join(name), data.swap_remove(0))?;
        Ok(())
    }

    /// Extracts everything into `path` and writes the archive metadata.
    pub fn extract(&self, path: &Path) -> Result<()> {
        self.fat.visit_directory(path, 1, &mut |dir, file_index| {
            self.extract_file(dir, file_index)
        })?;
        self.format_info().write_to(&path.join("metadata"))?;
        Ok(())
    }

    pub(crate) fn format_info(&self) -> ArchiveFormatInfo {
        // This matches how the emulator's service module formats extdata.
        ArchiveFormatInfo::new(
            0,
            self.fat.fs_info().maximum_directory_count,
            self.fat.fs_info().maximum_file_count,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests::wrap_in_disa;
    use crate::inner_fat::tests::build_image;

    /// Builds an on-disk extdata tree: device file 00000000/00000001 holds
    /// the VSXE image, 00000000/00000002.. hold the file bodies.
    fn build_extdata_tree(root: &Path, files: &[(&str, &[u8])]) {
        let vsxe = build_image(&VSXE_LAYOUT, &[], files, 0x200);
        let dev_dir = root.join("00000000");
        fs::create_dir_all(&dev_dir).unwrap();
        fs::write(dev_dir.join("00000001"), wrap_in_disa(&vsxe)).unwrap();

        for (i, (_, contents)) in files.iter().enumerate() {
            // File entry index is i + 1, device id one higher again.
            let device_id = i as u32 + 2;
            fs::write(
                dev_dir.join(format!("{device_id:08x}")),
                wrap_in_disa(contents),
            )
            .unwrap();
        }
    }

    #[test]
    fn extracts_sharded_files() {
        let src = tempfile::tempdir().unwrap();
        build_extdata_tree(src.path(), &[("banner.bin", b"BNR"), ("data.dat", b"DATA!")]);

        let extdata = Extdata::new(ExtdataSource::Plain(src.path().to_path_buf())).unwrap();
        let out = tempfile::tempdir().unwrap();
        extdata.extract(out.path()).unwrap();

        assert_eq!(fs::read(out.path().join("banner.bin")).unwrap(), b"BNR");
        assert_eq!(fs::read(out.path().join("data.dat")).unwrap(), b"DATA!");

        let metadata = fs::read(out.path().join("metadata")).unwrap();
        assert_eq!(metadata.len(), 0x10);
        // total_size 0, duplicate_data false
        assert_eq!(&metadata[..4], &[0, 0, 0, 0]);
        assert_eq!(metadata[12], 0);
    }

    #[test]
    fn missing_device_file_is_skipped_with_warning() {
        let src = tempfile::tempdir().unwrap();
        build_extdata_tree(src.path(), &[("present.bin", b"yes")]);
        // Add a second file entry whose device file is absent.
        let vsxe = build_image(
            &VSXE_LAYOUT,
            &[],
            &[("present.bin", b"yes"), ("gone.bin", b"no")],
            0x200,
        );
        fs::write(src.path().join("00000000/00000001"), wrap_in_disa(&vsxe)).unwrap();

        let extdata = Extdata::new(ExtdataSource::Plain(src.path().to_path_buf())).unwrap();
        let out = tempfile::tempdir().unwrap();
        extdata.extract(out.path()).unwrap();
        assert_eq!(fs::read(out.path().join("present.bin")).unwrap(), b"yes");
        assert!(!out.path().join("gone.bin").exists());
    }
}
