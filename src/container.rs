//! Host file access for the container
//!
//! All reads and writes go through absolute offsets into a single host file.
//! Metadata rewrites use [`ContainerFile::atomic_update`], which stages the
//! whole container in a temporary file in the same directory and renames it
//! over the original, so a crash mid-flush leaves the previous consistent
//! image intact.

use crate::error::{FsError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Open handle to the container host file
#[derive(Debug)]
pub struct ContainerFile {
    file: File,
    path: PathBuf,
}

impl ContainerFile {
    /// Create a new container file of exactly `total_size` bytes
    pub fn create(path: &Path, total_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;
        Ok(ContainerFile {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing container file for reading and writing
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    FsError::HostFileNotFound(path.display().to_string())
                }
                _ => FsError::HostIo(e),
            })?;
        Ok(ContainerFile {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the host file
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_region(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`
    pub fn write_region(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Flush buffered writes down to the device
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Rewrite the container through a same-directory temp file
    ///
    /// The current container is copied into a temp file, `update` mutates the
    /// copy, and the copy is renamed over the original. The open handle is
    /// reopened on the new file afterwards. On any failure the original is
    /// untouched.
    pub fn atomic_update<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> Result<()>,
    {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = NamedTempFile::new_in(dir)?;

        self.file.seek(SeekFrom::Start(0))?;
        io::copy(&mut self.file, staged.as_file_mut())?;

        update(staged.as_file_mut())?;
        staged.as_file_mut().sync_all()?;

        staged
            .persist(&self.path)
            .map_err(|e| FsError::HostIo(e.error))?;

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(())
    }
}
