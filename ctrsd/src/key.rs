use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::crypto::AesKey;
use crate::{Error, Result};

use hex_literal::hex;
use log::{debug, error};

/// AES key slot IDs used by this crate.
pub mod slot {
    pub const NCCH_SECURE1: usize = 0x2C;
    pub const NCCH_SECURE2: usize = 0x25;
    pub const NCCH_SECURE3: usize = 0x18;
    pub const NCCH_SECURE4: usize = 0x1B;
    /// SD content key. KeyY comes from movable.sed.
    pub const SD: usize = 0x26;
    /// Common key used for wrapping title keys in tickets.
    pub const TICKET_COMMON: usize = 0x3D;
    pub const MAX: usize = 0x40;
}

// The generator constant was calculated using the 0x39 KeyX and KeyY retrieved
// from a console and the normal key dumped elsewhere, solving:
// NormalKey = (((KeyX ROL 2) XOR KeyY) + constant) ROL 87
const GENERATOR_CONSTANT: AesKey = hex!("1FF9E9AAC5FE0408024591DC5D52768A");

/// KeyY candidates for the ticket common key, indexed by the common key
/// index stored in a ticket.
const COMMON_KEY_Y: [AesKey; 6] = [
    hex!("D07B337F9CA4385932A2E25723232EB9"),
    hex!("0C767230F0998F1C46828202FAACBE4C"),
    hex!("C475CB3AB8C788BB575E12A10907B8A4"),
    hex!("E486A355C45CC6FE84966B0470883521"),
    hex!("ED31BA9C04B067506C4497A35B7804FC"),
    hex!("5E66998AB4E8931606850FD7A16DD755"),
];

/// Generates a normal key from X and Y keys. Both rotations span the full
/// 128-bit width.
#[must_use]
pub fn keygen(x: &AesKey, y: &AesKey) -> AesKey {
    let x = u128::from_be_bytes(*x);
    let y = u128::from_be_bytes(*y);
    let gen = u128::from_be_bytes(GENERATOR_CONSTANT);
    ((x.rotate_left(2) ^ y).wrapping_add(gen))
        .rotate_left(87)
        .to_be_bytes()
}

#[derive(Clone, Copy, Default)]
struct KeySlot {
    x: Option<AesKey>,
    y: Option<AesKey>,
    normal: Option<AesKey>,
}

impl KeySlot {
    fn set_key_x(&mut self, key: AesKey) {
        self.x = Some(key);
        self.generate_normal_key();
    }

    fn set_key_y(&mut self, key: AesKey) {
        self.y = Some(key);
        self.generate_normal_key();
    }

    fn set_normal_key(&mut self, key: AesKey) {
        self.normal = Some(key);
    }

    fn generate_normal_key(&mut self) {
        self.normal = match (&self.x, &self.y) {
            (Some(x), Some(y)) => Some(keygen(x, y)),
            _ => None,
        };
    }
}

#[derive(Clone, Copy)]
struct KeyStore {
    slots: [KeySlot; slot::MAX],
}

static KEY_STORE: OnceLock<Mutex<KeyStore>> = OnceLock::new();

fn store() -> MutexGuard<'static, KeyStore> {
    KEY_STORE
        .get_or_init(|| {
            Mutex::new(KeyStore {
                slots: [KeySlot::default(); slot::MAX],
            })
        })
        .lock()
        .unwrap()
}

pub fn clear_keys() {
    store().slots = [KeySlot::default(); slot::MAX];
}

pub fn set_key_x(slot_id: usize, key: AesKey) {
    store().slots[slot_id].set_key_x(key);
}

pub fn set_key_y(slot_id: usize, key: AesKey) {
    store().slots[slot_id].set_key_y(key);
}

pub fn set_normal_key(slot_id: usize, key: AesKey) {
    store().slots[slot_id].set_normal_key(key);
}

#[must_use]
pub fn is_normal_key_available(slot_id: usize) -> bool {
    store().slots[slot_id].normal.is_some()
}

pub fn normal_key(slot_id: usize) -> Result<AesKey> {
    store().slots[slot_id].normal.ok_or(Error::MissingKey(slot_id))
}

pub fn key_x(slot_id: usize) -> Result<AesKey> {
    store().slots[slot_id].x.ok_or(Error::MissingKey(slot_id))
}

/// Installs the KeyY candidate for `index` into the ticket common key slot.
pub fn select_common_key_index(index: u8) -> Result<()> {
    let key = *COMMON_KEY_Y
        .get(index as usize)
        .ok_or(Error::MissingKey(slot::TICKET_COMMON))?;
    set_key_y(slot::TICKET_COMMON, key);
    Ok(())
}

#[must_use]
pub fn key_to_string(key: &AesKey) -> String {
    hex::encode_upper(key)
}

#[derive(Clone, Copy)]
struct KeyDesc {
    key_type: u8,
    slot_id: usize,
    // This key is identical to the previous entry's key
    same_as_before: bool,
}

const fn desc(key_type: u8, slot_id: usize, same_as_before: bool) -> KeyDesc {
    KeyDesc {
        key_type,
        slot_id,
        same_as_before,
    }
}

#[rustfmt::skip]
const BOOTROM_KEYS: [KeyDesc; 80] = [
    desc(b'X', 0x2C, false), desc(b'X', 0x2D, true),  desc(b'X', 0x2E, true),  desc(b'X', 0x2F, true),
    desc(b'X', 0x30, false), desc(b'X', 0x31, true),  desc(b'X', 0x32, true),  desc(b'X', 0x33, true),
    desc(b'X', 0x34, false), desc(b'X', 0x35, true),  desc(b'X', 0x36, true),  desc(b'X', 0x37, true),
    desc(b'X', 0x38, false), desc(b'X', 0x39, true),  desc(b'X', 0x3A, true),  desc(b'X', 0x3B, true),
    desc(b'X', 0x3C, false), desc(b'X', 0x3D, false), desc(b'X', 0x3E, false), desc(b'X', 0x3F, false),
    desc(b'Y', 0x04, false), desc(b'Y', 0x05, false), desc(b'Y', 0x06, false), desc(b'Y', 0x07, false),
    desc(b'Y', 0x08, false), desc(b'Y', 0x09, false), desc(b'Y', 0x0A, false), desc(b'Y', 0x0B, false),
    desc(b'N', 0x0C, false), desc(b'N', 0x0D, true),  desc(b'N', 0x0E, true),  desc(b'N', 0x0F, true),
    desc(b'N', 0x10, false), desc(b'N', 0x11, true),  desc(b'N', 0x12, true),  desc(b'N', 0x13, true),
    desc(b'N', 0x14, false), desc(b'N', 0x15, false), desc(b'N', 0x16, false), desc(b'N', 0x17, false),
    desc(b'N', 0x18, false), desc(b'N', 0x19, true),  desc(b'N', 0x1A, true),  desc(b'N', 0x1B, true),
    desc(b'N', 0x1C, false), desc(b'N', 0x1D, true),  desc(b'N', 0x1E, true),  desc(b'N', 0x1F, true),
    desc(b'N', 0x20, false), desc(b'N', 0x21, true),  desc(b'N', 0x22, true),  desc(b'N', 0x23, true),
    desc(b'N', 0x24, false), desc(b'N', 0x25, true),  desc(b'N', 0x26, true),  desc(b'N', 0x27, true),
    desc(b'N', 0x28, true),  desc(b'N', 0x29, false), desc(b'N', 0x2A, false), desc(b'N', 0x2B, false),
    desc(b'N', 0x2C, false), desc(b'N', 0x2D, true),  desc(b'N', 0x2E, true),  desc(b'N', 0x2F, true),
    desc(b'N', 0x30, false), desc(b'N', 0x31, true),  desc(b'N', 0x32, true),  desc(b'N', 0x33, true),
    desc(b'N', 0x34, false), desc(b'N', 0x35, true),  desc(b'N', 0x36, true),  desc(b'N', 0x37, true),
    desc(b'N', 0x38, false), desc(b'N', 0x39, true),  desc(b'N', 0x3A, true),  desc(b'N', 0x3B, true),
    desc(b'N', 0x3C, true),  desc(b'N', 0x3D, false), desc(b'N', 0x3E, false), desc(b'N', 0x3F, false),
];

const BOOTROM_SIZE: usize = 65536;
const BOOTROM_KEY_SECTION_START: usize = 55760;

/// Loads the fixed key schedule from a boot rom image.
///
/// The bootrom sets all these keys when executed, but later some of the
/// normal keys get overwritten by other applications. Those normal keys thus
/// aren't used by anything we import and have no value here, but reading them
/// keeps the cursor in sync with the descriptor table.
pub fn load_bootrom_keys(path: &Path) -> Result<()> {
    let data = fs::read(path)?;
    if data.len() != BOOTROM_SIZE {
        error!("Bootrom9 size is wrong: {}", data.len());
        return Err(Error::InvalidLength {
            what: "bootrom",
            actual: data.len(),
            expected: BOOTROM_SIZE,
        });
    }

    let mut pos = BOOTROM_KEY_SECTION_START;
    let mut new_key = [0u8; 0x10];
    // Stage all assignments before touching the store, so a short file
    // leaves the slots unchanged.
    let mut staged: Vec<(u8, usize, AesKey)> = Vec::with_capacity(BOOTROM_KEYS.len());
    for key in BOOTROM_KEYS {
        if !key.same_as_before {
            let end = pos + 0x10;
            if data.len() < end {
                error!("Reading from Bootrom9 failed");
                return Err(Error::OutOfRange);
            }
            new_key.copy_from_slice(&data[pos..end]);
            pos = end;
        }
        debug!(
            "Loaded Slot{:#04x} Key{}: {}",
            key.slot_id,
            key.key_type as char,
            key_to_string(&new_key)
        );
        staged.push((key.key_type, key.slot_id, new_key));
    }

    let mut keys = store();
    for (key_type, slot_id, key) in staged {
        match key_type {
            b'X' => keys.slots[slot_id].set_key_x(key),
            b'Y' => keys.slots[slot_id].set_key_y(key),
            b'N' => keys.slots[slot_id].set_normal_key(key),
            _ => unreachable!(),
        }
    }
    Ok(())
}

const MOVABLE_SED_KEY_SECTION_START: usize = 0x118;

/// Loads the console-unique KeyY from a movable.sed dump into the SD slot.
pub fn load_movable_sed_keys(path: &Path) -> Result<()> {
    let data = fs::read(path)?;
    if data.len() < MOVABLE_SED_KEY_SECTION_START + 0x10 {
        error!("movable.sed size is too small: {}", data.len());
        return Err(Error::OutOfRange);
    }

    let mut key = [0u8; 0x10];
    key.copy_from_slice(&data[MOVABLE_SED_KEY_SECTION_START..][..0x10]);
    set_key_y(slot::SD, key);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::MutexGuard;

    // The key store is process-wide; tests that touch it take this lock.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn lock() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn normal_key_follows_x_and_y() {
        let _guard = lock();
        clear_keys();

        assert!(!is_normal_key_available(0x11));
        set_key_x(0x11, [1u8; 0x10]);
        assert!(!is_normal_key_available(0x11));
        set_key_y(0x11, [2u8; 0x10]);
        assert!(is_normal_key_available(0x11));
        assert_eq!(normal_key(0x11).unwrap(), keygen(&[1u8; 0x10], &[2u8; 0x10]));

        clear_keys();
        assert!(!is_normal_key_available(0x11));
    }

    #[test]
    fn rotations_invert() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let n: u128 = rng.gen();
            assert_eq!(n.rotate_left(87).rotate_left(128 - 87), n);
            assert_eq!(n.rotate_left(2).rotate_right(2), n);
        }
    }

    fn synthetic_bootrom() -> Vec<u8> {
        let mut data = vec![0u8; BOOTROM_SIZE];
        let mut pos = BOOTROM_KEY_SECTION_START;
        let mut n = 0u8;
        for key in BOOTROM_KEYS {
            if !key.same_as_before {
                data[pos..pos + 0x10].copy_from_slice(&[n; 0x10]);
                pos += 0x10;
                n += 1;
            }
        }
        data
    }

    #[test]
    fn bootrom_loader_assigns_slots() {
        let _guard = lock();
        clear_keys();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&synthetic_bootrom()).unwrap();
        load_bootrom_keys(file.path()).unwrap();

        // First X entry and its same-as-before run
        assert_eq!(key_x(0x2C).unwrap(), [0u8; 0x10]);
        assert_eq!(key_x(0x2F).unwrap(), [0u8; 0x10]);
        assert_eq!(key_x(0x30).unwrap(), [1u8; 0x10]);
        // Normal keys are set directly
        assert!(is_normal_key_available(0x2C));
        assert!(is_normal_key_available(0x0C));

        clear_keys();
        assert!(!is_normal_key_available(0x2C));
    }

    #[test]
    fn bootrom_loader_rejects_bad_size() {
        let _guard = lock();
        clear_keys();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 123]).unwrap();
        assert!(load_bootrom_keys(file.path()).is_err());
        assert!(!is_normal_key_available(0x2C));
    }

    #[test]
    fn movable_sed_loads_sd_key_y() {
        let _guard = lock();
        clear_keys();

        let mut image = vec![0u8; 0x140];
        image[MOVABLE_SED_KEY_SECTION_START..][..0x10].copy_from_slice(&[0xAB; 0x10]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        load_movable_sed_keys(file.path()).unwrap();

        // Y alone does not make a normal key
        assert!(!is_normal_key_available(slot::SD));
        set_key_x(slot::SD, [0x01; 0x10]);
        assert!(is_normal_key_available(slot::SD));
        clear_keys();
    }
}
