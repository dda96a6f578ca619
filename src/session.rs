//! Mount lifecycle
//!
//! A [`Session`] is the exclusive in-memory view of one mounted container:
//! header, allocation table, directory tree, and the open host file. Mounting
//! loads and cross-validates all metadata; every mutating operation calls
//! [`Session::flush`], which rewrites the metadata regions atomically through
//! a temp-file rename.

use crate::container::ContainerFile;
use crate::dir::{DirTree, EntryId};
use crate::error::{FsError, Result};
use crate::fat::{Fat, CHAIN_END};
use crate::header::{Header, FAT_ENTRY_SIZE, HEADER_SIZE, ROOT_DIR_CAPACITY};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

/// Metadata state saved across a mutating operation
pub(crate) struct Snapshot {
    header: Header,
    fat: Fat,
    tree: DirTree,
    cwd: EntryId,
}

/// One mounted container
pub struct Session {
    pub(crate) header: Header,
    pub(crate) fat: Fat,
    pub(crate) tree: DirTree,
    pub(crate) file: ContainerFile,
    pub(crate) cwd: EntryId,
}

impl Session {
    /// Create a new container file and mount it
    ///
    /// Refuses to clobber an existing file unless `overwrite` is set.
    pub fn create(
        path: &Path,
        total_size: u64,
        block_size: u32,
        overwrite: bool,
    ) -> Result<Self> {
        if path.exists() && !overwrite {
            return Err(FsError::Config(format!(
                "{} already exists (pass overwrite to replace it)",
                path.display()
            )));
        }

        let header = Header::initialize(total_size, block_size)?;
        let file = ContainerFile::create(path, total_size)?;
        let fat = Fat::new(header.total_blocks);
        let tree = DirTree::new();

        let mut session = Session {
            header,
            fat,
            cwd: tree.root(),
            tree,
            file,
        };
        session.flush()?;
        info!(
            path = %path.display(),
            total_blocks = session.header.total_blocks,
            block_size = session.header.block_size,
            "container created"
        );
        Ok(session)
    }

    /// Mount an existing container
    ///
    /// All metadata is loaded and cross-validated before the session is
    /// handed out; any inconsistency refuses the mount.
    pub fn mount(path: &Path) -> Result<Self> {
        let mut file = ContainerFile::open(path)?;

        let actual_len = file.len()?;
        if actual_len < HEADER_SIZE as u64 {
            return Err(FsError::CorruptHeader(format!(
                "container is only {} bytes, smaller than the header",
                actual_len
            )));
        }

        let mut header_bytes = vec![0u8; HEADER_SIZE];
        file.read_region(0, &mut header_bytes)?;
        let header = Header::from_bytes(&header_bytes)?;

        if header.total_size != actual_len {
            return Err(FsError::CorruptHeader(format!(
                "header records {} bytes but the file holds {}",
                header.total_size, actual_len
            )));
        }

        let mut fat_bytes = vec![0u8; header.total_blocks as usize * FAT_ENTRY_SIZE];
        file.read_region(header.fat_offset, &mut fat_bytes)?;
        let fat = Fat::from_bytes(&fat_bytes, header.total_blocks)?;

        if fat.free_blocks() != header.free_blocks {
            return Err(FsError::CorruptFilesystem(format!(
                "header claims {} free blocks, allocation table holds {}",
                header.free_blocks,
                fat.free_blocks()
            )));
        }

        let tree = Self::load_tree(&header, &fat, &mut file)?;
        tree.validate()?;

        let session = Session {
            cwd: tree.root(),
            header,
            fat,
            tree,
            file,
        };
        session.validate_chains()?;

        debug!(
            path = %path.display(),
            entries = session.tree.len(),
            free_blocks = session.fat.free_blocks(),
            "container mounted"
        );
        Ok(session)
    }

    /// Flush pending state and release the container
    pub fn unmount(mut self) -> Result<()> {
        self.flush()?;
        self.file.sync()?;
        info!(path = %self.file.path().display(), "container unmounted");
        Ok(())
    }

    /// Read the directory tree from the root region plus its spill chain
    fn load_tree(header: &Header, fat: &Fat, file: &mut ContainerFile) -> Result<DirTree> {
        let mut blob = vec![0u8; ROOT_DIR_CAPACITY];
        file.read_region(header.root_dir_offset, &mut blob)?;

        for step in fat.walk(header.dir_spill_block) {
            let block = step.map_err(|e| {
                FsError::CorruptFilesystem(format!("directory spill chain: {}", e))
            })?;
            let mut chunk = vec![0u8; header.block_size as usize];
            file.read_region(header.block_offset(block), &mut chunk)?;
            blob.extend_from_slice(&chunk);
        }

        if (header.dir_byte_len as usize) > blob.len() {
            return Err(FsError::CorruptFilesystem(format!(
                "directory metadata claims {} bytes but only {} are reachable",
                header.dir_byte_len,
                blob.len()
            )));
        }
        blob.truncate(header.dir_byte_len as usize);

        bincode::deserialize(&blob)
            .map_err(|e| FsError::CorruptFilesystem(format!("directory metadata: {}", e)))
    }

    /// Every allocated block must belong to exactly one chain
    fn validate_chains(&self) -> Result<()> {
        let total = self.fat.total_blocks() as usize;
        let mut owner = vec![false; total + 1];

        let mut claim = |start: i64, what: String| -> Result<u64> {
            let mut count = 0u64;
            for step in self.fat.walk(start) {
                let block = step
                    .map_err(|e| FsError::CorruptFilesystem(format!("{}: {}", what, e)))?;
                if owner[block as usize] {
                    return Err(FsError::CorruptFilesystem(format!(
                        "block {} belongs to more than one chain ({})",
                        block, what
                    )));
                }
                owner[block as usize] = true;
                count += 1;
            }
            Ok(count)
        };

        let mut used = claim(
            self.header.dir_spill_block,
            "directory spill chain".to_string(),
        )?;
        for (id, entry) in self.tree.entries() {
            if entry.is_file() {
                used += claim(entry.start_block, self.tree.full_path(id))?;
            }
        }

        if used + self.fat.free_blocks() != self.fat.total_blocks() {
            return Err(FsError::CorruptFilesystem(format!(
                "{} blocks in chains and {} free do not account for {} total",
                used,
                self.fat.free_blocks(),
                self.fat.total_blocks()
            )));
        }
        Ok(())
    }

    /// Persist header, allocation table, and directory tree
    ///
    /// The serialized tree beyond the fixed root region spills into a fresh
    /// block chain; the new chain is allocated before the old one is freed so
    /// a failed allocation leaves the previous image intact. All metadata
    /// regions land in one atomic container rewrite.
    pub fn flush(&mut self) -> Result<()> {
        let blob = bincode::serialize(&self.tree)
            .map_err(|e| FsError::CorruptFilesystem(format!("directory metadata: {}", e)))?;

        let block_size = self.header.block_size as usize;
        let spill = if blob.len() > ROOT_DIR_CAPACITY {
            let remainder = &blob[ROOT_DIR_CAPACITY..];
            let n_blocks = remainder.len().div_ceil(block_size) as u64;
            let blocks = self.fat.allocate(n_blocks)?;
            Some((blocks, remainder.to_vec()))
        } else {
            None
        };
        let old_spill = self.header.dir_spill_block;
        self.fat.free(old_spill)?;

        self.header.dir_spill_block = match &spill {
            Some((blocks, _)) => blocks[0] as i64,
            None => CHAIN_END,
        };
        self.header.dir_byte_len = blob.len() as u64;
        self.header.free_blocks = self.fat.free_blocks();

        let header_bytes = self.header.to_bytes();
        let fat_bytes = self.fat.to_bytes();

        let mut root_region = vec![0u8; ROOT_DIR_CAPACITY];
        let head = blob.len().min(ROOT_DIR_CAPACITY);
        root_region[..head].copy_from_slice(&blob[..head]);

        let mut spill_writes: Vec<(u64, Vec<u8>)> = Vec::new();
        if let Some((blocks, remainder)) = &spill {
            for (i, &block) in blocks.iter().enumerate() {
                let lo = i * block_size;
                let hi = (lo + block_size).min(remainder.len());
                let mut chunk = vec![0u8; block_size];
                chunk[..hi - lo].copy_from_slice(&remainder[lo..hi]);
                spill_writes.push((self.header.block_offset(block), chunk));
            }
        }

        let fat_offset = self.header.fat_offset;
        let root_dir_offset = self.header.root_dir_offset;
        self.file.atomic_update(move |f| {
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&header_bytes)?;
            f.seek(SeekFrom::Start(fat_offset))?;
            f.write_all(&fat_bytes)?;
            f.seek(SeekFrom::Start(root_dir_offset))?;
            f.write_all(&root_region)?;
            for (offset, chunk) in &spill_writes {
                f.seek(SeekFrom::Start(*offset))?;
                f.write_all(chunk)?;
            }
            Ok(())
        })
    }

    /// In-memory metadata state captured before a mutating operation
    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            header: self.header,
            fat: self.fat.clone(),
            tree: self.tree.clone(),
            cwd: self.cwd,
        }
    }

    /// Roll the in-memory metadata back to a snapshot
    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.header = snapshot.header;
        self.fat = snapshot.fat;
        self.tree = snapshot.tree;
        self.cwd = snapshot.cwd;
    }

    /// Flush, rolling the in-memory state back if the flush fails
    ///
    /// A mutating operation that cannot be persisted must not survive in
    /// memory either, or the next successful flush would persist it.
    pub(crate) fn commit(&mut self, snapshot: Snapshot) -> Result<()> {
        match self.flush() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.restore(snapshot);
                Err(e)
            }
        }
    }

    /// Read one data block in full
    pub(crate) fn read_block(&mut self, block: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.header.block_size as usize];
        let offset = self.header.block_offset(block);
        self.file.read_region(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write one data block, zero-padding short payloads
    pub(crate) fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        let block_size = self.header.block_size as usize;
        debug_assert!(data.len() <= block_size);
        let offset = self.header.block_offset(block);
        if data.len() == block_size {
            self.file.write_region(offset, data)
        } else {
            let mut padded = vec![0u8; block_size];
            padded[..data.len()].copy_from_slice(data);
            self.file.write_region(offset, &padded)
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_create_and_remount() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("box.cfs");

        let session = Session::create(&path, MIB, 1024, false).unwrap();
        let total = session.header.total_blocks;
        assert_eq!(session.header.free_blocks, total);
        session.unmount().unwrap();

        let session = Session::mount(&path).unwrap();
        assert_eq!(session.header.total_blocks, total);
        assert_eq!(session.fat.free_blocks(), total);
        assert_eq!(session.tree.len(), 1);
    }

    #[test]
    fn test_create_refuses_existing_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("box.cfs");
        Session::create(&path, MIB, 1024, false)
            .unwrap()
            .unmount()
            .unwrap();

        assert!(matches!(
            Session::create(&path, MIB, 1024, false),
            Err(FsError::Config(_))
        ));
        // overwrite replaces it
        Session::create(&path, 2 * MIB, 512, true)
            .unwrap()
            .unmount()
            .unwrap();
        let session = Session::mount(&path).unwrap();
        assert_eq!(session.header.block_size, 512);
    }

    #[test]
    fn test_mount_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Session::mount(&dir.path().join("absent.cfs")),
            Err(FsError::HostFileNotFound(_))
        ));
    }

    #[test]
    fn test_mount_rejects_length_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("box.cfs");
        Session::create(&path, MIB, 1024, false)
            .unwrap()
            .unmount()
            .unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(MIB + 4096).unwrap();
        drop(file);

        assert!(matches!(
            Session::mount(&path),
            Err(FsError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_mount_rejects_truncated_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("box.cfs");
        Session::create(&path, MIB, 1024, false)
            .unwrap()
            .unmount()
            .unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(100).unwrap();
        drop(file);

        assert!(matches!(
            Session::mount(&path),
            Err(FsError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_restore_discards_mutations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("box.cfs");
        let mut session = Session::create(&path, MIB, 1024, false).unwrap();
        let total = session.fat.free_blocks();

        let snapshot = session.snapshot();
        session
            .tree
            .insert(session.tree.root(), crate::dir::Entry::directory("x"))
            .unwrap();
        session.fat.allocate(3).unwrap();

        session.restore(snapshot);
        assert_eq!(session.tree.len(), 1);
        assert_eq!(session.fat.free_blocks(), total);
        session.unmount().unwrap();
    }

    #[test]
    fn test_flush_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("box.cfs");
        let mut session = Session::create(&path, MIB, 1024, false).unwrap();
        let free = session.fat.free_blocks();
        session.flush().unwrap();
        session.flush().unwrap();
        assert_eq!(session.fat.free_blocks(), free);
        session.unmount().unwrap();
        Session::mount(&path).unwrap();
    }
}
