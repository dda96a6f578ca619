//! Block allocation table
//!
//! One signed 32-bit entry per data block: `0` free, `-1` end-of-chain, any
//! other value the 1-based index of the next block in the chain. Block
//! indices are 1-based so the free marker can never collide with a successor
//! pointer. Allocation scans from a rotating cursor (first-fit with
//! wraparound) so freshly freed blocks are not immediately reused, which
//! spreads wear and keeps chains from interleaving pathologically.
//!
//! Every traversal is guarded against cycles: a chain that does not reach the
//! end marker within `total_blocks` steps is reported as corrupt instead of
//! looping forever.

use crate::error::{FsError, Result};
use crate::header::FAT_ENTRY_SIZE;

/// Sentinel for "no block" / end of a chain in entry metadata
pub const CHAIN_END: i64 = -1;

const FREE: i32 = 0;
const END_OF_CHAIN: i32 = -1;

/// In-memory allocation table
#[derive(Debug, Clone)]
pub struct Fat {
    /// One entry per block; position `i` describes block `i + 1`
    table: Vec<i32>,

    /// Number of free blocks
    free_blocks: u64,

    /// Rotating first-fit cursor (table position)
    cursor: usize,
}

impl Fat {
    /// Create a table with every block free
    pub fn new(total_blocks: u64) -> Self {
        Fat {
            table: vec![FREE; total_blocks as usize],
            free_blocks: total_blocks,
            cursor: 0,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        self.table.len() as u64
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    /// Allocate a chain of `n_blocks` blocks
    ///
    /// Returns the blocks in chain order. The table is only modified when the
    /// full request can be satisfied.
    pub fn allocate(&mut self, n_blocks: u64) -> Result<Vec<u32>> {
        if n_blocks == 0 {
            return Ok(Vec::new());
        }
        if n_blocks > self.free_blocks {
            return Err(FsError::OutOfSpace {
                needed: n_blocks,
                free: self.free_blocks,
            });
        }

        let len = self.table.len();
        let mut picked: Vec<usize> = Vec::with_capacity(n_blocks as usize);
        for offset in 0..len {
            let pos = (self.cursor + offset) % len;
            if self.table[pos] == FREE {
                picked.push(pos);
                if picked.len() as u64 == n_blocks {
                    self.cursor = (pos + 1) % len;
                    break;
                }
            }
        }
        debug_assert_eq!(picked.len() as u64, n_blocks);

        for pair in picked.windows(2) {
            self.table[pair[0]] = (pair[1] + 1) as i32;
        }
        if let Some(&last) = picked.last() {
            self.table[last] = END_OF_CHAIN;
        }

        self.free_blocks -= n_blocks;
        Ok(picked.into_iter().map(|pos| (pos + 1) as u32).collect())
    }

    /// Release a chain back to the free pool
    ///
    /// A `start` of `CHAIN_END` is a no-op. The chain is walked and fully
    /// validated before any entry is zeroed, so a corrupt chain leaves the
    /// table unchanged. Returns the number of blocks freed.
    pub fn free(&mut self, start: i64) -> Result<u64> {
        if start == CHAIN_END {
            return Ok(0);
        }
        let blocks = self.chain(start)?;
        for &block in &blocks {
            self.table[(block - 1) as usize] = FREE;
        }
        self.free_blocks += blocks.len() as u64;
        Ok(blocks.len() as u64)
    }

    /// Lazily walk a chain without mutating the table
    pub fn walk(&self, start: i64) -> ChainWalk<'_> {
        ChainWalk {
            fat: self,
            next: start,
            steps: 0,
        }
    }

    /// Collect a full chain, validating it along the way
    pub fn chain(&self, start: i64) -> Result<Vec<u32>> {
        self.walk(start).collect()
    }

    /// Serialize as little-endian i32 entries
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.table.len() * FAT_ENTRY_SIZE);
        for entry in &self.table {
            bytes.extend_from_slice(&entry.to_le_bytes());
        }
        bytes
    }

    /// Deserialize, checking every entry is a plausible table value
    pub fn from_bytes(bytes: &[u8], total_blocks: u64) -> Result<Self> {
        if bytes.len() != total_blocks as usize * FAT_ENTRY_SIZE {
            return Err(FsError::CorruptFilesystem(format!(
                "allocation table length {} does not match {} blocks",
                bytes.len(),
                total_blocks
            )));
        }

        let mut table = Vec::with_capacity(total_blocks as usize);
        let mut free_blocks = 0u64;
        for (i, chunk) in bytes.chunks_exact(FAT_ENTRY_SIZE).enumerate() {
            let value = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if value == FREE {
                free_blocks += 1;
            } else if value != END_OF_CHAIN
                && !(1..=total_blocks as i64).contains(&(value as i64))
            {
                return Err(FsError::CorruptFilesystem(format!(
                    "allocation entry {} holds out-of-range value {}",
                    i + 1,
                    value
                )));
            }
            table.push(value);
        }

        Ok(Fat {
            table,
            free_blocks,
            cursor: 0,
        })
    }
}

/// Iterator over the blocks of one chain, with cycle guard
pub struct ChainWalk<'a> {
    fat: &'a Fat,
    next: i64,
    steps: u64,
}

impl Iterator for ChainWalk<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == CHAIN_END {
            return None;
        }

        self.steps += 1;
        if self.steps > self.fat.total_blocks() {
            self.next = CHAIN_END;
            return Some(Err(FsError::CorruptChain(format!(
                "chain exceeds {} blocks without terminating",
                self.fat.total_blocks()
            ))));
        }

        let block = self.next;
        if !(1..=self.fat.total_blocks() as i64).contains(&block) {
            self.next = CHAIN_END;
            return Some(Err(FsError::CorruptChain(format!(
                "block index {} out of range",
                block
            ))));
        }

        let entry = self.fat.table[(block - 1) as usize];
        if entry == FREE {
            self.next = CHAIN_END;
            return Some(Err(FsError::CorruptChain(format!(
                "chain enters free block {}",
                block
            ))));
        }

        self.next = entry as i64;
        Some(Ok(block as u32))
    }
}
