use crate::{Error, Layout, Result};

use log::error;
use static_assertions::assert_eq_size;

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct DataDescriptor {
    pub offset: u64,
    pub size: u64,
}
assert_eq_size!([u8; 0x10], DataDescriptor);
unsafe impl Layout for DataDescriptor {}

#[derive(Clone, Copy)]
#[repr(C)]
struct DisaHeader {
    magic: [u8; 4],
    version: u32,
    partition_count: u32,
    _pad0: [u8; 4],
    secondary_partition_table_offset: u64,
    primary_partition_table_offset: u64,
    partition_table_size: u64,
    partition_descriptors: [DataDescriptor; 2],
    partitions: [DataDescriptor; 2],
    active_partition_table: u8,
    _pad1: [u8; 3],
    sha_hash: [u8; 0x20],
    _pad2: [u8; 0x74],
}
assert_eq_size!([u8; 0x100], DisaHeader);
unsafe impl Layout for DisaHeader {}

// The unique identifier lands on a misaligned offset, hence packed.
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct DiffHeader {
    magic: [u8; 4],
    version: u32,
    secondary_partition_table_offset: u64,
    primary_partition_table_offset: u64,
    partition_table_size: u64,
    partition_a: DataDescriptor,
    active_partition_table: u8,
    _pad0: [u8; 3],
    sha_hash: [u8; 0x20],
    unique_identifier: u64,
    _pad1: [u8; 0xA4],
}
assert_eq_size!([u8; 0x100], DiffHeader);
unsafe impl Layout for DiffHeader {}

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct DifiHeader {
    magic: [u8; 4],
    version: u32,
    ivfc: DataDescriptor,
    dpfs: DataDescriptor,
    partition_hash: DataDescriptor,
    enable_external_ivfc_level_4: u8,
    dpfs_level1_selector: u8,
    _pad0: [u8; 2],
    external_ivfc_level_4_offset: u64,
}
assert_eq_size!([u8; 0x44], DifiHeader);
unsafe impl Layout for DifiHeader {}

/// Descriptor for both IVFC and DPFS levels
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct LevelDescriptor {
    pub offset: u64,
    pub size: u64,
    /// In log2
    pub block_size: u32,
    _pad0: [u8; 4],
}
assert_eq_size!([u8; 0x18], LevelDescriptor);
unsafe impl Layout for LevelDescriptor {}

impl LevelDescriptor {
    pub(crate) fn new(offset: u64, size: u64, block_size: u32) -> Self {
        Self {
            offset,
            size,
            block_size,
            _pad0: [0; 4],
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
struct IvfcDescriptor {
    magic: [u8; 4],
    version: u32,
    master_hash_size: u64,
    levels: [LevelDescriptor; 4],
    descriptor_size: u64,
}
assert_eq_size!([u8; 0x78], IvfcDescriptor);
unsafe impl Layout for IvfcDescriptor {}

#[derive(Clone, Copy)]
#[repr(C)]
struct DpfsDescriptor {
    magic: [u8; 4],
    version: u32,
    levels: [LevelDescriptor; 3],
}
assert_eq_size!([u8; 0x50], DpfsDescriptor);
unsafe impl Layout for DpfsDescriptor {}

unsafe impl Layout for u32 {}

/// The two-replica bit-selection tree protecting a partition's payload.
/// Level 1 bits pick the authoritative level 2 replica, level 2 bits pick
/// the level 3 replica each byte is served from.
struct DpfsTree {
    levels: [LevelDescriptor; 3],
    level1_selector: u8,
    data: Vec<u8>,
}

impl DpfsTree {
    fn new(descriptor: DpfsDescriptor, level1_selector: u8, data: Vec<u8>) -> Result<Self> {
        if &descriptor.magic != b"DPFS" {
            error!("DPFS magic is not correct");
            return Err(Error::InvalidMagic);
        }
        if descriptor.version != 0x10000 {
            error!("DPFS version {:x} is not correct", descriptor.version);
            return Err(Error::UnsupportedVersion);
        }
        Ok(Self {
            levels: descriptor.levels,
            level1_selector,
            data,
        })
    }

    fn bit(&self, level: usize, selector: u8, index: u64) -> Result<u8> {
        let desc = self.levels[level];
        let word_offset = desc.offset + u64::from(selector) * desc.size + (index / 32) * 4;
        let offset = usize::try_from(word_offset).map_err(|_| Error::OutOfRange)?;
        let word = u32::read_from(&self.data, offset)?;
        Ok(((word >> (31 - (index % 32))) & 1) as u8)
    }

    fn byte(&self, level: usize, selector: u8, index: u64) -> Result<u8> {
        let desc = self.levels[level];
        let offset = usize::try_from(desc.offset + u64::from(selector) * desc.size + index)
            .map_err(|_| Error::OutOfRange)?;
        self.data.get(offset).copied().ok_or(Error::OutOfRange)
    }

    /// Reconstructs the authoritative level 3 image byte by byte through the
    /// two-step selection chain.
    fn level3_data(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.levels[2].size).map_err(|_| Error::OutOfRange)?;
        let mut out = vec![0u8; size];
        for (i, byte) in out.iter_mut().enumerate() {
            let i = i as u64;
            let level2_bit_index = i >> self.levels[2].block_size;
            let level1_bit_index = (level2_bit_index / 8) >> self.levels[1].block_size;
            let level2_selector = self.bit(0, self.level1_selector, level1_bit_index)?;
            let level3_selector = self.bit(1, level2_selector, level2_bit_index)?;
            *byte = self.byte(2, level3_selector, i)?;
        }
        Ok(out)
    }
}

/// DISA/DIFF container: one or two integrity-protected partitions behind a
/// header at a fixed 0x100 offset.
pub struct DataContainer {
    data: Vec<u8>,
    partition_count: u32,
    partition_table_offset: u64,
    partition_descriptors: Vec<DataDescriptor>,
    partitions: Vec<DataDescriptor>,
}

impl DataContainer {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 0x200 {
            error!("Data size {:#x} is too small", data.len());
            return Err(Error::OutOfRange);
        }

        let magic: [u8; 4] = data[0x100..0x104].try_into().unwrap();
        match &magic {
            b"DISA" => Self::init_disa(data),
            b"DIFF" => Self::init_diff(data),
            _ => {
                error!("Unknown magic {:02x?}", magic);
                Err(Error::InvalidMagic)
            }
        }
    }

    fn init_disa(data: Vec<u8>) -> Result<Self> {
        let header = DisaHeader::read_from(&data, 0x100)?;
        if header.version != 0x40000 {
            error!("DISA version {:x} is not correct", header.version);
            return Err(Error::UnsupportedVersion);
        }

        let partition_table_offset = if header.active_partition_table == 0 {
            header.primary_partition_table_offset
        } else {
            header.secondary_partition_table_offset
        };

        let (partition_descriptors, partitions) = if header.partition_count == 2 {
            (
                header.partition_descriptors.to_vec(),
                header.partitions.to_vec(),
            )
        } else {
            (
                vec![header.partition_descriptors[0]],
                vec![header.partitions[0]],
            )
        };

        Ok(Self {
            data,
            partition_count: header.partition_count,
            partition_table_offset,
            partition_descriptors,
            partitions,
        })
    }

    fn init_diff(data: Vec<u8>) -> Result<Self> {
        let header = DiffHeader::read_from(&data, 0x100)?;
        let version = header.version;
        if version != 0x30000 {
            error!("DIFF version {version:x} is not correct");
            return Err(Error::UnsupportedVersion);
        }

        let partition_table_offset = if header.active_partition_table == 0 {
            header.primary_partition_table_offset
        } else {
            header.secondary_partition_table_offset
        };
        let partition_a = header.partition_a;

        Ok(Self {
            data,
            partition_count: 1,
            partition_table_offset,
            partition_descriptors: vec![DataDescriptor {
                offset: 0,
                size: header.partition_table_size,
            }],
            partitions: vec![partition_a],
        })
    }

    fn slice(&self, offset: u64, size: u64) -> Result<&[u8]> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfRange)?;
        let len = usize::try_from(size).map_err(|_| Error::OutOfRange)?;
        let end = start.checked_add(len).ok_or(Error::OutOfRange)?;
        self.data.get(start..end).ok_or(Error::OutOfRange)
    }

    /// Unwraps one partition, returning the data in its IVFC level 4.
    fn partition_data(&self, index: usize) -> Result<Vec<u8>> {
        let descriptor = self
            .partition_descriptors
            .get(index)
            .ok_or(Error::OutOfRange)?;
        let partition = *self.partitions.get(index).ok_or(Error::OutOfRange)?;
        let descriptor_offset = self.partition_table_offset + descriptor.offset;
        let descriptor_offset_us =
            usize::try_from(descriptor_offset).map_err(|_| Error::OutOfRange)?;

        let difi = DifiHeader::read_from(&self.data, descriptor_offset_us)?;
        let difi_magic = difi.magic;
        if &difi_magic != b"DIFI" {
            error!("DIFI magic is not correct");
            return Err(Error::InvalidMagic);
        }
        let difi_version = difi.version;
        if difi_version != 0x10000 {
            error!("DIFI version {difi_version:x} is not correct");
            return Err(Error::UnsupportedVersion);
        }

        let ivfc_loc = difi.ivfc;
        if ivfc_loc.size < core::mem::size_of::<IvfcDescriptor>() as u64 {
            error!("IVFC descriptor size is too small");
            return Err(Error::OutOfRange);
        }
        let ivfc = IvfcDescriptor::read_from(
            &self.data,
            descriptor_offset_us
                .checked_add(usize::try_from(ivfc_loc.offset).map_err(|_| Error::OutOfRange)?)
                .ok_or(Error::OutOfRange)?,
        )?;

        if difi.enable_external_ivfc_level_4 != 0 {
            let external_offset = difi.external_ivfc_level_4_offset;
            let slice = self.slice(
                partition
                    .offset
                    .checked_add(external_offset)
                    .ok_or(Error::OutOfRange)?,
                ivfc.levels[3].size,
            )?;
            return Ok(slice.to_vec());
        }

        // Unwrap the DPFS tree
        let dpfs_loc = difi.dpfs;
        if dpfs_loc.size < core::mem::size_of::<DpfsDescriptor>() as u64 {
            error!("DPFS descriptor size is too small");
            return Err(Error::OutOfRange);
        }
        let dpfs = DpfsDescriptor::read_from(
            &self.data,
            descriptor_offset_us
                .checked_add(usize::try_from(dpfs_loc.offset).map_err(|_| Error::OutOfRange)?)
                .ok_or(Error::OutOfRange)?,
        )?;

        let partition_data = self.slice(partition.offset, partition.size)?.to_vec();
        let tree = DpfsTree::new(dpfs, difi.dpfs_level1_selector, partition_data)?;
        let ivfc_data = tree.level3_data()?;

        let start = usize::try_from(ivfc.levels[3].offset).map_err(|_| Error::OutOfRange)?;
        let len = usize::try_from(ivfc.levels[3].size).map_err(|_| Error::OutOfRange)?;
        let end = start.checked_add(len).ok_or(Error::OutOfRange)?;
        ivfc_data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(Error::OutOfRange)
    }

    /// Unwraps the whole container, returning the IVFC level 4 data of all
    /// partitions.
    pub fn ivfc_level4_data(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.partition_count as usize)
            .map(|i| self.partition_data(i))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::mem;

    fn put<T: Layout>(buf: &mut [u8], offset: usize, value: &T) {
        buf[offset..offset + mem::size_of::<T>()].copy_from_slice(value.as_bytes());
    }

    fn external_difi(level4_size: u64, level4_offset: u64) -> (Vec<u8>, Vec<u8>) {
        let difi = DifiHeader {
            magic: *b"DIFI",
            version: 0x10000,
            ivfc: DataDescriptor {
                offset: 0x44,
                size: 0x78,
            },
            dpfs: DataDescriptor::default(),
            partition_hash: DataDescriptor::default(),
            enable_external_ivfc_level_4: 1,
            dpfs_level1_selector: 0,
            _pad0: [0; 2],
            external_ivfc_level_4_offset: level4_offset,
        };
        let mut levels = [LevelDescriptor::default(); 4];
        levels[3].size = level4_size;
        let ivfc = IvfcDescriptor {
            magic: *b"IVFC",
            version: 0x20000,
            master_hash_size: 0,
            levels,
            descriptor_size: 0x78,
        };
        (difi.as_bytes().to_vec(), ivfc.as_bytes().to_vec())
    }

    /// Wraps a payload into a minimal single-partition DISA blob with an
    /// external IVFC level 4, for other modules' tests.
    pub(crate) fn wrap_in_disa(payload: &[u8]) -> Vec<u8> {
        let data_offset = 0x400u64;
        let mut blob = vec![0u8; 0x400 + payload.len()];
        let header = DisaHeader {
            magic: *b"DISA",
            version: 0x40000,
            partition_count: 1,
            _pad0: [0; 4],
            secondary_partition_table_offset: 0,
            primary_partition_table_offset: 0x200,
            partition_table_size: 0x200,
            partition_descriptors: [
                DataDescriptor { offset: 0, size: 0xBC },
                DataDescriptor::default(),
            ],
            partitions: [
                DataDescriptor {
                    offset: data_offset,
                    size: payload.len() as u64,
                },
                DataDescriptor::default(),
            ],
            active_partition_table: 0,
            _pad1: [0; 3],
            sha_hash: [0; 0x20],
            _pad2: [0; 0x74],
        };
        put(&mut blob, 0x100, &header);

        let (difi, ivfc) = external_difi(payload.len() as u64, 0);
        blob[0x200..0x244].copy_from_slice(&difi);
        blob[0x244..0x2BC].copy_from_slice(&ivfc);
        blob[0x400..].copy_from_slice(payload);
        blob
    }

    #[test]
    fn disa_two_partitions_external_level4() {
        // Layout: header @0x100, partition table @0x200 (two DIFI+IVFC
        // descriptor blocks), partition data @0x400 and @0x600.
        let mut blob = vec![0u8; 0x800];

        let header = DisaHeader {
            magic: *b"DISA",
            version: 0x40000,
            partition_count: 2,
            _pad0: [0; 4],
            secondary_partition_table_offset: 0,
            primary_partition_table_offset: 0x200,
            partition_table_size: 0x200,
            partition_descriptors: [
                DataDescriptor { offset: 0, size: 0xBC },
                DataDescriptor { offset: 0x100, size: 0xBC },
            ],
            partitions: [
                DataDescriptor { offset: 0x400, size: 0x200 },
                DataDescriptor { offset: 0x600, size: 0x200 },
            ],
            active_partition_table: 0,
            _pad1: [0; 3],
            sha_hash: [0; 0x20],
            _pad2: [0; 0x74],
        };
        put(&mut blob, 0x100, &header);

        let (difi, ivfc) = external_difi(0x100, 0x40);
        for table_offset in [0x200usize, 0x300] {
            blob[table_offset..table_offset + 0x44].copy_from_slice(&difi);
            blob[table_offset + 0x44..table_offset + 0xBC].copy_from_slice(&ivfc);
        }

        for (base, fill) in [(0x400usize, 0xAAu8), (0x600, 0xBB)] {
            for b in &mut blob[base + 0x40..base + 0x140] {
                *b = fill;
            }
        }

        let container = DataContainer::new(blob).unwrap();
        let data = container.ivfc_level4_data().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0], vec![0xAA; 0x100]);
        assert_eq!(data[1], vec![0xBB; 0x100]);
    }

    #[test]
    fn wrapped_payload_round_trips() {
        let payload: Vec<u8> = (0..0x300u32).map(|v| v as u8).collect();
        let container = DataContainer::new(wrap_in_disa(&payload)).unwrap();
        let data = container.ivfc_level4_data().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0], payload);
    }

    #[test]
    fn rejects_unknown_magic_and_version() {
        let mut blob = vec![0u8; 0x400];
        blob[0x100..0x104].copy_from_slice(b"NOPE");
        assert!(matches!(DataContainer::new(blob), Err(Error::InvalidMagic)));

        let mut blob = vec![0u8; 0x400];
        blob[0x100..0x104].copy_from_slice(b"DISA");
        blob[0x104..0x108].copy_from_slice(&0x30000u32.to_le_bytes());
        assert!(matches!(
            DataContainer::new(blob),
            Err(Error::UnsupportedVersion)
        ));

        assert!(DataContainer::new(vec![0u8; 0x100]).is_err());
    }

    #[test]
    fn dpfs_selection_chain() {
        // One level-1 word, one level-2 word per replica, 16 bytes of
        // level 3 per replica. Level 2 blocks are 16 bytes, so every output
        // byte resolves through level-2 bit 0.
        let descriptor = DpfsDescriptor {
            magic: *b"DPFS",
            version: 0x10000,
            levels: [
                LevelDescriptor::new(0, 4, 0),
                LevelDescriptor::new(8, 4, 0),
                LevelDescriptor::new(16, 16, 4),
            ],
        };

        let mut data = vec![0u8; 48];
        data[16..32].copy_from_slice(&[0x11; 16]); // level 3, replica 0
        data[32..48].copy_from_slice(&[0x22; 16]); // level 3, replica 1

        // All selector bits zero: replica 0 everywhere.
        let tree = DpfsTree::new(descriptor, 0, data.clone()).unwrap();
        assert_eq!(tree.level3_data().unwrap(), vec![0x11; 16]);

        // Level-1 replica 0 bit 0 set -> level 2 replica 1; its bit 0 set
        // -> level 3 replica 1. Bits are MSB-first within each word.
        data[0..4].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        data[12..16].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        let tree = DpfsTree::new(descriptor, 0, data).unwrap();
        assert_eq!(tree.level3_data().unwrap(), vec![0x22; 16]);
    }
}
