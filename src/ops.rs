//! File operations
//!
//! Everything that moves bytes between the host and the container, plus the
//! namespace operations the shell exposes. File content is streamed one block
//! at a time in both directions, so memory use never depends on file size.
//! Every mutating operation ends with a metadata flush; if the flush fails
//! the in-memory mutation is rolled back, so a reported failure never shows
//! up in later listings or flushes.

use crate::dir::{validate_name, Entry, EntryId, EntryKind};
use crate::error::{FsError, Result};
use crate::fat::CHAIN_END;
use crate::integrity::{hex_digest, ChunkHasher};
use crate::session::Session;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::debug;

/// Snapshot of one entry's metadata
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub blocks: u64,
    pub created_at: u64,
    pub modified_at: u64,
    pub protected: bool,
    pub content_hash: Option<String>,
}

/// Usage summary for the whole container
#[derive(Debug, Clone, Copy)]
pub struct SpaceInfo {
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub free_bytes: u64,
}

/// Outcome of an integrity check
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub path: String,
    pub matches: bool,
    pub stored: String,
    pub computed: String,
}

impl Session {
    /// Copy a host file into the container
    ///
    /// `dest` may name the target file or an existing directory; in the
    /// latter case the host file's name is kept. Content is hashed while it
    /// streams in and the digest is stored with the entry.
    pub fn copy_in(&mut self, host_path: &Path, dest: &str) -> Result<EntryInfo> {
        let mut host = File::open(host_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                FsError::HostFileNotFound(host_path.display().to_string())
            }
            _ => FsError::HostIo(e),
        })?;
        let size = host.metadata()?.len();

        let (parent, name) = self.destination(host_path, dest)?;
        validate_name(&name)?;
        if !self.tree.entry(parent).is_directory() {
            return Err(FsError::NotADirectory(self.tree.full_path(parent)));
        }
        if self.tree.resolve(parent, &name).is_ok() {
            return Err(FsError::DuplicateName(format!(
                "{}/{}",
                self.tree.full_path(parent).trim_end_matches('/'),
                name
            )));
        }

        let snapshot = self.snapshot();
        let block_size = self.header.block_size as u64;
        let n_blocks = size.div_ceil(block_size);
        let blocks = self.fat.allocate(n_blocks)?;
        let start_block = blocks.first().map(|&b| b as i64).unwrap_or(CHAIN_END);

        let mut hasher = ChunkHasher::new(self.header.hash_algorithm);
        let mut remaining = size;
        for &block in &blocks {
            let take = remaining.min(block_size) as usize;
            let mut chunk = vec![0u8; take];
            if let Err(e) = host.read_exact(&mut chunk) {
                self.restore(snapshot);
                return Err(FsError::HostIo(e));
            }
            hasher.update(&chunk);
            if let Err(e) = self.write_block(block, &chunk) {
                self.restore(snapshot);
                return Err(e);
            }
            remaining -= take as u64;
        }
        let digest = hasher.finalize();

        let entry = Entry::file(name, size, digest, start_block);
        let id = match self.tree.insert(parent, entry) {
            Ok(id) => id,
            Err(e) => {
                self.restore(snapshot);
                return Err(e);
            }
        };
        self.commit(snapshot)?;

        debug!(
            path = %self.tree.full_path(id),
            size,
            blocks = n_blocks,
            "file copied in"
        );
        Ok(self.entry_info(id))
    }

    /// Copy a file out of the container onto the host
    ///
    /// The host file is written first; when `verify` is set and the
    /// recomputed digest disagrees with the stored one, the copy is reported
    /// as an integrity failure but the host file is left in place for
    /// inspection.
    pub fn copy_out(&mut self, src: &str, host_path: &Path, verify: bool) -> Result<()> {
        let id = self.tree.resolve(self.cwd, src)?;
        let entry = self.tree.entry(id);
        if !entry.is_file() {
            return Err(FsError::NotAFile(self.tree.full_path(id)));
        }
        let size = entry.size;
        let stored = entry.content_hash.unwrap_or([0u8; 32]);
        let start_block = entry.start_block;

        let chain = self.fat.chain(start_block)?;
        if (chain.len() as u64) * (self.header.block_size as u64) < size {
            return Err(FsError::CorruptFilesystem(format!(
                "{} records {} bytes but its chain holds only {} blocks",
                self.tree.full_path(id),
                size,
                chain.len()
            )));
        }

        let mut host = File::create(host_path)?;
        let block_size = self.header.block_size as u64;
        let mut hasher = ChunkHasher::new(self.header.hash_algorithm);
        let mut remaining = size;
        for &block in &chain {
            let take = remaining.min(block_size) as usize;
            let data = self.read_block(block)?;
            hasher.update(&data[..take]);
            host.write_all(&data[..take])?;
            remaining -= take as u64;
        }
        host.sync_all()?;

        if verify {
            let computed = hasher.finalize();
            if computed != stored {
                return Err(FsError::Integrity {
                    stored: hex_digest(&stored),
                    computed: hex_digest(&computed),
                });
            }
        }
        Ok(())
    }

    /// Recompute a file's digest and compare it with the stored one
    pub fn verify(&mut self, path: &str) -> Result<VerifyReport> {
        let id = self.tree.resolve(self.cwd, path)?;
        let entry = self.tree.entry(id);
        if !entry.is_file() {
            return Err(FsError::NotAFile(self.tree.full_path(id)));
        }
        let size = entry.size;
        let stored = entry.content_hash.unwrap_or([0u8; 32]);
        let chain = self.fat.chain(entry.start_block)?;

        let block_size = self.header.block_size as u64;
        let mut hasher = ChunkHasher::new(self.header.hash_algorithm);
        let mut remaining = size;
        for &block in &chain {
            let take = remaining.min(block_size) as usize;
            let data = self.read_block(block)?;
            hasher.update(&data[..take]);
            remaining -= take as u64;
        }
        let computed = hasher.finalize();

        Ok(VerifyReport {
            path: self.tree.full_path(id),
            matches: computed == stored,
            stored: hex_digest(&stored),
            computed: hex_digest(&computed),
        })
    }

    /// Create a directory
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.tree.resolve_parent(self.cwd, path)?;
        let snapshot = self.snapshot();
        self.tree.insert(parent, Entry::directory(name))?;
        self.commit(snapshot)
    }

    /// Remove a file
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let id = self.tree.resolve(self.cwd, path)?;
        if !self.tree.entry(id).is_file() {
            return Err(FsError::NotAFile(self.tree.full_path(id)));
        }
        let snapshot = self.snapshot();
        let chains = self.tree.remove(id, false)?;
        for start in chains {
            if let Err(e) = self.fat.free(start) {
                self.restore(snapshot);
                return Err(e);
            }
        }
        self.commit(snapshot)
    }

    /// Remove a directory, recursively when asked
    ///
    /// Recursive removal frees the content chains of every file underneath.
    /// If the working directory was inside the removed subtree it resets to
    /// the root.
    pub fn rmdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let id = self.tree.resolve(self.cwd, path)?;
        if !self.tree.entry(id).is_directory() {
            return Err(FsError::NotADirectory(self.tree.full_path(id)));
        }
        let cwd_inside = self.is_ancestor(id, self.cwd);

        let snapshot = self.snapshot();
        let chains = self.tree.remove(id, recursive)?;
        for start in chains {
            if let Err(e) = self.fat.free(start) {
                self.restore(snapshot);
                return Err(e);
            }
        }
        if cwd_inside {
            self.cwd = self.tree.root();
        }
        self.commit(snapshot)
    }

    /// Rename or move an entry
    pub fn rename(&mut self, path: &str, target: &str) -> Result<()> {
        let id = self.tree.resolve(self.cwd, path)?;
        let snapshot = self.snapshot();
        self.tree.rename(self.cwd, id, target)?;
        self.commit(snapshot)
    }

    /// Set or clear the protection flag
    pub fn protect(&mut self, path: &str, protected: bool) -> Result<()> {
        let id = self.tree.resolve(self.cwd, path)?;
        if id == self.tree.root() {
            return Err(FsError::Config("cannot protect the root directory".into()));
        }
        let snapshot = self.snapshot();
        self.tree.entry_mut(id).protected = protected;
        self.commit(snapshot)
    }

    /// List a directory (the working directory when `path` is None)
    pub fn list(&self, path: Option<&str>) -> Result<Vec<EntryInfo>> {
        let id = match path {
            Some(p) => self.tree.resolve(self.cwd, p)?,
            None => self.cwd,
        };
        Ok(self
            .tree
            .list(id)?
            .into_iter()
            .map(|child| self.entry_info(child))
            .collect())
    }

    /// Metadata for one entry
    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        let id = self.tree.resolve(self.cwd, path)?;
        Ok(self.entry_info(id))
    }

    /// Usage summary
    pub fn space(&self) -> SpaceInfo {
        let free_blocks = self.fat.free_blocks();
        let total_blocks = self.header.total_blocks;
        SpaceInfo {
            total_bytes: self.header.total_size,
            reserved_bytes: self.header.reserved_bytes,
            block_size: self.header.block_size,
            total_blocks,
            free_blocks,
            used_blocks: total_blocks - free_blocks,
            free_bytes: free_blocks * self.header.block_size as u64,
        }
    }

    /// Block chains of every file plus the directory overflow chain
    ///
    /// Debug view over the allocation table, keyed by absolute path.
    pub fn chain_map(&self) -> Result<Vec<(String, Vec<u32>)>> {
        let mut map = Vec::new();
        if self.header.dir_spill_block != CHAIN_END {
            map.push((
                "(directory tree)".to_string(),
                self.fat.chain(self.header.dir_spill_block)?,
            ));
        }
        for (id, entry) in self.tree.entries() {
            if entry.is_file() && entry.start_block != CHAIN_END {
                map.push((self.tree.full_path(id), self.fat.chain(entry.start_block)?));
            }
        }
        Ok(map)
    }

    /// Change the working directory
    pub fn cd(&mut self, path: &str) -> Result<String> {
        let id = self.tree.resolve(self.cwd, path)?;
        if !self.tree.entry(id).is_directory() {
            return Err(FsError::NotADirectory(self.tree.full_path(id)));
        }
        self.cwd = id;
        Ok(self.tree.full_path(id))
    }

    /// Absolute path of the working directory
    pub fn pwd(&self) -> String {
        self.tree.full_path(self.cwd)
    }

    fn entry_info(&self, id: EntryId) -> EntryInfo {
        let entry = self.tree.entry(id);
        let blocks = if entry.is_file() {
            entry.size.div_ceil(self.header.block_size as u64)
        } else {
            0
        };
        EntryInfo {
            path: self.tree.full_path(id),
            name: entry.name.clone(),
            kind: entry.kind,
            size: entry.size,
            blocks,
            created_at: entry.created_at,
            modified_at: entry.modified_at,
            protected: entry.protected,
            content_hash: entry.content_hash.as_ref().map(hex_digest),
        }
    }

    /// Resolve the target parent and name for copy_in
    fn destination(&self, host_path: &Path, dest: &str) -> Result<(EntryId, String)> {
        let host_name = || -> Result<String> {
            host_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    FsError::Config(format!(
                        "cannot derive a file name from {}",
                        host_path.display()
                    ))
                })
        };

        if dest.is_empty() {
            return Ok((self.cwd, host_name()?));
        }
        if let Ok(id) = self.tree.resolve(self.cwd, dest) {
            if self.tree.entry(id).is_directory() {
                return Ok((id, host_name()?));
            }
            return Err(FsError::DuplicateName(self.tree.full_path(id)));
        }
        self.tree.resolve_parent(self.cwd, dest)
    }

    fn is_ancestor(&self, ancestor: EntryId, mut id: EntryId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.tree.entry(id).parent {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }
}

/// Render a byte count with a binary-unit suffix
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(human_size(1536), "1.5 KiB");
    }
}
