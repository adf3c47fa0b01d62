//! File-backed memory map wrapper

use crate::{Error, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Read-write mapping of a whole file
pub struct MappedFile {
    inner: MmapMut,
    path: PathBuf,
    size: usize,
}

impl MappedFile {
    /// Create (or truncate) `path`, size it to `size` bytes and map it
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::LogBuffer(format!(
                "cannot map empty file {}",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| Error::LogBuffer(format!("{}: {}", path.display(), e)))?;
        file.set_len(size as u64)?;

        // Safety: the log files are private to this rank and nothing else
        // truncates them while mapped.
        let inner = unsafe { MmapMut::map_mut(&file) }?;

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Map an existing file without changing its contents
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::LogBuffer(format!("{}: {}", path.display(), e)))?;

        let inner = unsafe { MmapMut::map_mut(&file) }?;
        let size = inner.len();

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Path of the mapped file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapping in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
