use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::crypto::AesKey;
use crate::{Error, Layout, Result};

use log::error;
use static_assertions::assert_eq_size;

/// One record of the GM9 support file encTitleKeys.bin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct TitleKeyEntry {
    common_key_index: [u8; 4],
    _pad0: [u8; 4],
    title_id: [u8; 8],
    pub title_key: AesKey,
}
assert_eq_size!([u8; 0x20], TitleKeyEntry);
unsafe impl Layout for TitleKeyEntry {}

impl TitleKeyEntry {
    #[must_use]
    pub fn new(common_key_index: u32, title_id: u64, title_key: AesKey) -> Self {
        Self {
            common_key_index: common_key_index.to_be_bytes(),
            _pad0: [0; 4],
            title_id: title_id.to_be_bytes(),
            title_key,
        }
    }
    #[must_use]
    pub fn common_key_index(&self) -> u32 {
        u32::from_be_bytes(self.common_key_index)
    }
    #[must_use]
    pub fn title_id(&self) -> u64 {
        u64::from_be_bytes(self.title_id)
    }
}

/// Encrypted title keys, keyed by title ID.
pub type TitleKeysMap = HashMap<u64, TitleKeyEntry>;

/// Loads an encTitleKeys.bin / decTitleKeys.bin support file.
pub fn load(path: &Path) -> Result<TitleKeysMap> {
    let data = fs::read(path).map_err(|e| {
        error!("Could not open {}", path.display());
        Error::from(e)
    })?;
    from_bytes(&data)
}

pub fn from_bytes(data: &[u8]) -> Result<TitleKeysMap> {
    let count_bytes: [u8; 4] = data.get(..4).ok_or(Error::OutOfRange)?.try_into().unwrap();
    let count = u32::from_le_bytes(count_bytes) as usize;

    let mut out = TitleKeysMap::new();
    let mut pos = 16;
    for i in 0..count {
        let entry = TitleKeyEntry::read_from(data, pos).map_err(|e| {
            error!("Could not read entry {i}");
            e
        })?;
        pos += core::mem::size_of::<TitleKeyEntry>();
        out.insert(entry.title_id(), entry);
    }

    if pos != data.len() {
        error!("File has redundant data, may be corrupted");
        return Err(Error::OutOfRange);
    }
    Ok(out)
}

#[must_use]
pub fn to_bytes(map: &TitleKeysMap) -> Vec<u8> {
    let mut entries: Vec<&TitleKeyEntry> = map.values().collect();
    entries.sort_by_key(|entry| entry.title_id());

    let mut out = Vec::with_capacity(16 + entries.len() * 0x20);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 12]);
    for entry in entries {
        out.extend_from_slice(entry.as_bytes());
    }
    out
}

pub fn save<W: Write>(map: &TitleKeysMap, writer: &mut W) -> Result<()> {
    writer.write_all(&to_bytes(map))?;
    Ok(())
}
