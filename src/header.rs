//! Container format header
//!
//! The header occupies the first 512 bytes of the container and describes the
//! complete geometry: block size, block count, and the byte offsets of the
//! allocation table, root directory region, and data region. Everything else
//! in the container is located through these fields, so the header carries a
//! CRC32 of its own bytes and is validated strictly on load.

use crate::error::{FsError, Result};
use crate::fat::CHAIN_END;
use crate::integrity::HashAlgorithm;

pub const MAGIC: [u8; 8] = *b"CAPFS\x00\x01\x00";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 512;

/// Fixed capacity of the root directory region in bytes; directory metadata
/// beyond this spills into a regular block chain
pub const ROOT_DIR_CAPACITY: usize = 8192;

/// Bytes per allocation table entry (i32)
pub const FAT_ENTRY_SIZE: usize = 4;

pub const MIN_TOTAL_SIZE: u64 = 1024 * 1024; // 1 MiB
pub const MAX_TOTAL_SIZE: u64 = 16 * 1024 * 1024 * 1024; // 16 GiB
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

// Byte offset of the CRC32 within the serialized header; everything before it
// is covered by the checksum.
const CRC_OFFSET: usize = 89;

/// Container header (bytes 0..512)
///
/// Layout on disk, little-endian:
///
/// ```text
/// magic[8] vmaj[2] vmin[2] hash_alg[1] block_size[4]
/// total_size[8] total_blocks[8] free_blocks[8]
/// fat_offset[8] root_dir_offset[8] data_offset[8] reserved_bytes[8]
/// dir_spill_block[8] dir_byte_len[8] crc32[4] zero padding to 512
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic number: "CAPFS\x00\x01\x00"
    pub magic: [u8; 8],

    /// Format version (major)
    pub version_major: u16,

    /// Format version (minor)
    pub version_minor: u16,

    /// Content hash algorithm for this container
    pub hash_algorithm: HashAlgorithm,

    /// Block size in bytes (power of two, 512..=65536)
    pub block_size: u32,

    /// Exact logical container length in bytes
    pub total_size: u64,

    /// Number of data blocks
    pub total_blocks: u64,

    /// Number of free data blocks
    pub free_blocks: u64,

    /// Byte offset of the allocation table
    pub fat_offset: u64,

    /// Byte offset of the root directory region
    pub root_dir_offset: u64,

    /// Byte offset of the first data block
    pub data_offset: u64,

    /// Header + allocation table + root directory region, in bytes
    pub reserved_bytes: u64,

    /// Start block of the directory overflow chain, CHAIN_END if none
    pub dir_spill_block: i64,

    /// Exact serialized length of the directory tree in bytes
    pub dir_byte_len: u64,
}

impl Header {
    /// Compute the geometry for a new container
    ///
    /// Solves `total_blocks = (total_size - fixed) / (block_size + 4)` so the
    /// allocation table and the data region both fit inside `total_size`.
    pub fn initialize(total_size: u64, block_size: u32) -> Result<Self> {
        if !(MIN_TOTAL_SIZE..=MAX_TOTAL_SIZE).contains(&total_size) {
            return Err(FsError::Config(format!(
                "container size {} out of range ({}..={} bytes)",
                total_size, MIN_TOTAL_SIZE, MAX_TOTAL_SIZE
            )));
        }
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(FsError::Config(format!(
                "block size {} must be a power of two in {}..={}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }

        let fixed = (HEADER_SIZE + ROOT_DIR_CAPACITY) as u64;
        let per_block = block_size as u64 + FAT_ENTRY_SIZE as u64;
        let total_blocks = (total_size - fixed) / per_block;
        if total_blocks < 1 {
            return Err(FsError::Config(format!(
                "container size {} too small for a single {}-byte block",
                total_size, block_size
            )));
        }

        let fat_offset = HEADER_SIZE as u64;
        let root_dir_offset = fat_offset + total_blocks * FAT_ENTRY_SIZE as u64;
        let data_offset = root_dir_offset + ROOT_DIR_CAPACITY as u64;

        Ok(Header {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            hash_algorithm: HashAlgorithm::Sha256,
            block_size,
            total_size,
            total_blocks,
            free_blocks: total_blocks,
            fat_offset,
            root_dir_offset,
            data_offset,
            reserved_bytes: fixed + total_blocks * FAT_ENTRY_SIZE as u64,
            dir_spill_block: CHAIN_END,
            dir_byte_len: 0,
        })
    }

    /// Validate internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(FsError::CorruptHeader("invalid magic number".into()));
        }
        if self.version_major != VERSION_MAJOR {
            return Err(FsError::CorruptHeader(format!(
                "unsupported format version {}.{}",
                self.version_major, self.version_minor
            )));
        }
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(FsError::CorruptHeader(format!(
                "invalid block size {}",
                self.block_size
            )));
        }
        if self.total_blocks < 1 {
            return Err(FsError::CorruptHeader("zero data blocks".into()));
        }
        if self.free_blocks > self.total_blocks {
            return Err(FsError::CorruptHeader(format!(
                "free blocks {} exceed total blocks {}",
                self.free_blocks, self.total_blocks
            )));
        }
        if self.reserved_bytes + self.total_blocks * self.block_size as u64 > self.total_size {
            return Err(FsError::CorruptHeader(
                "reserved region and data blocks exceed container size".into(),
            ));
        }

        let fat_offset = HEADER_SIZE as u64;
        let root_dir_offset = fat_offset + self.total_blocks * FAT_ENTRY_SIZE as u64;
        let data_offset = root_dir_offset + ROOT_DIR_CAPACITY as u64;
        if self.fat_offset != fat_offset
            || self.root_dir_offset != root_dir_offset
            || self.data_offset != data_offset
            || self.reserved_bytes != data_offset
        {
            return Err(FsError::CorruptHeader(
                "region offsets inconsistent with block count".into(),
            ));
        }
        if self.dir_spill_block != CHAIN_END
            && !(1..=self.total_blocks as i64).contains(&self.dir_spill_block)
        {
            return Err(FsError::CorruptHeader(format!(
                "directory spill block {} out of range",
                self.dir_spill_block
            )));
        }
        Ok(())
    }

    /// Byte offset of a data block (block indices are 1-based)
    pub fn block_offset(&self, block: u32) -> u64 {
        self.data_offset + (block as u64 - 1) * self.block_size as u64
    }

    /// Serialize to exactly HEADER_SIZE bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.push(self.hash_algorithm.as_u8());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.total_size.to_le_bytes());
        bytes.extend_from_slice(&self.total_blocks.to_le_bytes());
        bytes.extend_from_slice(&self.free_blocks.to_le_bytes());
        bytes.extend_from_slice(&self.fat_offset.to_le_bytes());
        bytes.extend_from_slice(&self.root_dir_offset.to_le_bytes());
        bytes.extend_from_slice(&self.data_offset.to_le_bytes());
        bytes.extend_from_slice(&self.reserved_bytes.to_le_bytes());
        bytes.extend_from_slice(&self.dir_spill_block.to_le_bytes());
        bytes.extend_from_slice(&self.dir_byte_len.to_le_bytes());

        debug_assert_eq!(bytes.len(), CRC_OFFSET);
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        bytes.resize(HEADER_SIZE, 0);
        bytes
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(FsError::CorruptHeader(format!(
                "expected {} header bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(FsError::CorruptHeader("invalid magic number".into()));
        }

        let stored_crc = get_u32(bytes, CRC_OFFSET);
        let computed_crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if stored_crc != computed_crc {
            return Err(FsError::CorruptHeader(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                stored_crc, computed_crc
            )));
        }

        let hash_algorithm = HashAlgorithm::from_u8(bytes[12]).ok_or_else(|| {
            FsError::CorruptHeader(format!("unknown hash algorithm {}", bytes[12]))
        })?;

        let header = Header {
            magic,
            version_major: get_u16(bytes, 8),
            version_minor: get_u16(bytes, 10),
            hash_algorithm,
            block_size: get_u32(bytes, 13),
            total_size: get_u64(bytes, 17),
            total_blocks: get_u64(bytes, 25),
            free_blocks: get_u64(bytes, 33),
            fat_offset: get_u64(bytes, 41),
            root_dir_offset: get_u64(bytes, 49),
            data_offset: get_u64(bytes, 57),
            reserved_bytes: get_u64(bytes, 65),
            dir_spill_block: get_u64(bytes, 73) as i64,
            dir_byte_len: get_u64(bytes, 81),
        };

        header.validate()?;
        Ok(header)
    }
}

fn get_u16(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([b[o], b[o + 1]])
}

fn get_u32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
}

fn get_u64(b: &[u8], o: usize) -> u64 {
    u64::from_le_bytes([
        b[o],
        b[o + 1],
        b[o + 2],
        b[o + 3],
        b[o + 4],
        b[o + 5],
        b[o + 6],
        b[o + 7],
    ])
}
