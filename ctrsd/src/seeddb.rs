use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::crypto::AesKey;
use crate::{Error, Layout, Result};

use log::{error, warn};
use static_assertions::assert_eq_size;

const SEEDDB_PADDING_BYTES: usize = 12;

/// One seed record: title ID plus the 16-byte seed used for seed crypto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Seed {
    pub title_id: u64,
    pub data: AesKey,
    _reserved: [u8; 8],
}
assert_eq_size!([u8; 0x20], Seed);
unsafe impl Layout for Seed {}

impl Seed {
    #[must_use]
    pub fn new(title_id: u64, data: AesKey) -> Self {
        Self {
            title_id,
            data,
            _reserved: [0; 8],
        }
    }
}

/// The seed database file: little-endian count, padding, then the records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedDb {
    pub seeds: Vec<Seed>,
}

impl SeedDb {
    /// Loads a seeddb.bin. A missing file is not an error, merely empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Seed database does not exist");
            return Ok(Self::default());
        }
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let count_bytes: [u8; 4] = data.get(..4).ok_or(Error::OutOfRange)?.try_into().unwrap();
        let count = u32::from_le_bytes(count_bytes) as usize;

        let mut seeds = Vec::with_capacity(count);
        let mut pos = 4 + SEEDDB_PADDING_BYTES;
        for i in 0..count {
            let seed = Seed::read_from(data, pos).map_err(|e| {
                error!("Failed to read seed {i}");
                e
            })?;
            pos += core::mem::size_of::<Seed>();
            seeds.push(seed);
        }
        Ok(Self { seeds })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + SEEDDB_PADDING_BYTES + self.seeds.len() * 0x20);
        out.extend_from_slice(&(self.seeds.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; SEEDDB_PADDING_BYTES]);
        for seed in &self.seeds {
            out.extend_from_slice(seed.as_bytes());
        }
        out
    }

    pub fn add(&mut self, seed: Seed) {
        self.seeds.push(seed);
    }

    #[must_use]
    pub fn get(&self, title_id: u64) -> Option<AesKey> {
        self.seeds
            .iter()
            .find(|seed| seed.title_id == title_id)
            .map(|seed| seed.data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

static SEED_DB: OnceLock<Mutex<SeedDb>> = OnceLock::new();

fn store() -> MutexGuard<'static, SeedDb> {
    SEED_DB
        .get_or_init(|| Mutex::new(SeedDb::default()))
        .lock()
        .unwrap()
}

/// Loads the process-wide seed database used for NCCH seed crypto.
pub fn load_global(path: &Path) -> Result<()> {
    let db = SeedDb::load(path)?;
    *store() = db;
    Ok(())
}

#[must_use]
pub fn get_seed(title_id: u64) -> Option<AesKey> {
    store().get(title_id)
}

pub fn clear_global() {
    store().seeds.clear();
}
