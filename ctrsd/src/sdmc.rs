use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::copier::{CopyControl, FileCopier, ProgressCallback};
use crate::crypto::{self, aes128::*, AesKey, CryptoTransform};
use crate::key::{self, slot};
use crate::{Error, Result};

use log::error;
use std::sync::Arc;

fn strip_leading_slash(source: &str) -> &str {
    source.strip_prefix('/').unwrap_or(source)
}

/// Decrypts files out of the SD card's content area. Every file is
/// AES-CTR encrypted with the SD key and a counter derived from its own
/// path relative to the "Nintendo 3DS/<ID0>/<ID1>" root.
pub struct SdmcDecryptor {
    root_folder: PathBuf,
    copier: FileCopier,
}

impl SdmcDecryptor {
    pub fn new(root_folder: PathBuf) -> Result<Self> {
        if !key::is_normal_key_available(slot::SD) {
            error!("SD key must be available in order to decrypt");
            return Err(Error::MissingKey(slot::SD));
        }
        Ok(Self {
            root_folder,
            copier: FileCopier::new(),
        })
    }

    /// Restarts progress accounting for a content possibly spanning
    /// multiple files.
    pub fn reset_progress(&mut self, total_size: u64) {
        self.copier.reset(total_size);
    }

    /// Decrypts a file from the SD card and streams it into `destination`.
    /// Blocks, but can be aborted from another thread (returning an error).
    ///
    /// `source` is relative to the root folder, starting with "/".
    pub fn decrypt_and_write_file(
        &mut self,
        source: &str,
        destination: &Path,
        callback: &ProgressCallback<'_>,
    ) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let key = key::normal_key(slot::SD)?;
        let ctr = crypto::file_ctr(source);
        self.copier
            .set_transform(Some(CryptoTransform::aes_ctr(&key, &ctr, 0)));

        let mut source_file = fs::File::open(self.root_folder.join(strip_leading_slash(source)))?;
        let size = source_file.metadata()?.len();
        let mut destination_file = fs::File::create(destination)?;
        self.copier
            .run(&mut source_file, size, &mut destination_file, callback)
    }

    pub fn abort(&self) {
        self.copier.abort();
    }

    #[must_use]
    pub fn control(&self) -> Arc<CopyControl> {
        self.copier.control()
    }

    /// Decrypts a file and reads it into a vector.
    pub fn decrypt_file(&self, source: &str) -> Result<Vec<u8>> {
        let key = key::normal_key(slot::SD)?;
        let ctr = crypto::file_ctr(source);

        let path = self.root_folder.join(strip_leading_slash(source));
        let mut data = fs::read(&path).map_err(|e| {
            error!("Could not read {}", path.display());
            Error::from(e)
        })?;
        crypto::ctr_crypt(&key, &ctr, &mut data);
        Ok(data)
    }
}

/// Read-only view of an SD card file that decrypts transparently, keeping
/// the CTR keystream in sync across seeks.
pub struct SdmcFile {
    file: fs::File,
    aes: Aes128Ctr,
}

impl SdmcFile {
    /// Opens `filename` (relative to the root folder, starting with "/").
    pub fn open(root_folder: &Path, filename: &str) -> Result<Self> {
        let key = key::normal_key(slot::SD)?;
        let ctr = crypto::file_ctr(filename);
        let file = fs::File::open(root_folder.join(strip_leading_slash(filename)))?;
        Ok(Self {
            file,
            aes: Aes128Ctr::new(&key.into(), &ctr.into()),
        })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Read for SdmcFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let length_read = self.file.read(buf)?;
        self.aes.apply_keystream(&mut buf[..length_read]);
        Ok(length_read)
    }
}

impl Seek for SdmcFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = self.file.seek(pos)?;
        self.aes.seek(new_pos);
        Ok(new_pos)
    }
}

/// The counter used to wrap a title key, as used with the common key.
#[must_use]
pub fn title_key_iv(title_id: u64) -> AesKey {
    let mut iv = [0u8; 0x10];
    iv[..8].copy_from_slice(&title_id.to_be_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::no_progress;
    use crate::key;

    fn encrypt_fixture(root: &Path, rel: &str, plaintext: &[u8], key: &AesKey) {
        let ctr = crypto::file_ctr(rel);
        let mut data = plaintext.to_vec();
        crypto::ctr_crypt(key, &ctr, &mut data);
        let path = root.join(rel.trim_start_matches('/'));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn decrypt_file_and_streaming_agree() {
        let _guard = key::tests::lock();
        key::clear_keys();
        let sd_key = [0x42u8; 0x10];
        key::set_normal_key(slot::SD, sd_key);

        let root = tempfile::tempdir().unwrap();
        let plaintext: Vec<u8> = (0..40_000u32).map(|v| (v * 7) as u8).collect();
        encrypt_fixture(root.path(), "/title/data.bin", &plaintext, &sd_key);

        let mut decryptor = SdmcDecryptor::new(root.path().to_path_buf()).unwrap();
        assert_eq!(decryptor.decrypt_file("/title/data.bin").unwrap(), plaintext);

        let out = root.path().join("out.bin");
        decryptor.reset_progress(plaintext.len() as u64);
        decryptor
            .decrypt_and_write_file("/title/data.bin", &out, no_progress())
            .unwrap();
        assert_eq!(fs::read(out).unwrap(), plaintext);
        key::clear_keys();
    }

    #[test]
    fn sdmc_file_seek_keeps_keystream_in_sync() {
        let _guard = key::tests::lock();
        key::clear_keys();
        let sd_key = [0x13u8; 0x10];
        key::set_normal_key(slot::SD, sd_key);

        let root = tempfile::tempdir().unwrap();
        let plaintext: Vec<u8> = (0..4096u32).map(|v| (v ^ 0x5A) as u8).collect();
        encrypt_fixture(root.path(), "/content.app", &plaintext, &sd_key);

        let mut file = SdmcFile::open(root.path(), "/content.app").unwrap();
        let mut head = vec![0u8; 100];
        file.read_exact(&mut head).unwrap();
        assert_eq!(head, &plaintext[..100]);

        file.seek(SeekFrom::Start(1000)).unwrap();
        let mut mid = vec![0u8; 500];
        file.read_exact(&mut mid).unwrap();
        assert_eq!(mid, &plaintext[1000..1500]);
        key::clear_keys();
    }
}
