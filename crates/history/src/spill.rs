//! Cold storage for history batches evicted from the in-memory cache.
//!
//! Each stored blob is one batch of length-delimited envelopes. Blobs are
//! addressed by insertion order.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub trait SpillStore: Send {
    /// Append a blob.
    fn store(&mut self, blob: &[u8]) -> io::Result<()>;

    /// Read back the blob at `index`.
    fn load(&mut self, index: usize) -> io::Result<Vec<u8>>;

    /// Drop all blobs but keep the store usable.
    fn clear(&mut self) -> io::Result<()>;

    /// Drop all blobs and release backing storage.
    fn release(&mut self) -> io::Result<()>;
}

// ============================================================================
// Memory
// ============================================================================

/// Keeps spilled batches in encoded form. Encoded batches are much smaller
/// than decoded envelope vectors.
#[derive(Debug, Default)]
pub struct MemorySpill {
    blobs: Vec<Vec<u8>>,
}

impl MemorySpill {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpillStore for MemorySpill {
    fn store(&mut self, blob: &[u8]) -> io::Result<()> {
        self.blobs.push(blob.to_vec());
        Ok(())
    }

    fn load(&mut self, index: usize) -> io::Result<Vec<u8>> {
        self.blobs.get(index).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no spilled batch {index}"))
        })
    }

    fn clear(&mut self) -> io::Result<()> {
        self.blobs.clear();
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        self.blobs = Vec::new();
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// Appends spilled batches to a single file.
#[derive(Debug)]
pub struct FileSpill {
    path: PathBuf,
    file: Option<File>,
    /// (offset, length) of each blob.
    spans: Vec<(u64, u64)>,
    end: u64,
}

impl FileSpill {
    /// Create (or truncate) the spill file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            spans: Vec::new(),
            end: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("spill file already released"))
    }
}

impl SpillStore for FileSpill {
    fn store(&mut self, blob: &[u8]) -> io::Result<()> {
        let offset = self.end;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(blob)?;
        self.spans.push((offset, blob.len() as u64));
        self.end += blob.len() as u64;
        Ok(())
    }

    fn load(&mut self, index: usize) -> io::Result<Vec<u8>> {
        let (offset, len) = *self.spans.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no spilled batch {index}"))
        })?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn clear(&mut self) -> io::Result<()> {
        self.file()?.set_len(0)?;
        self.spans.clear();
        self.end = 0;
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        self.spans.clear();
        self.end = 0;
        if self.file.take().is_some() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_spill_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = FileSpill::create(&dir.path().join("spill.bin")).unwrap();

        spill.store(b"first").unwrap();
        spill.store(b"second batch").unwrap();

        assert_eq!(spill.load(1).unwrap(), b"second batch");
        assert_eq!(spill.load(0).unwrap(), b"first");
        assert!(spill.load(2).is_err());
    }

    #[test]
    fn test_file_spill_release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.bin");
        let mut spill = FileSpill::create(&path).unwrap();
        spill.store(b"data").unwrap();

        spill.release().unwrap();
        assert!(!path.exists());
        assert!(spill.store(b"more").is_err());
    }

    #[test]
    fn test_clear_keeps_store_usable() {
        let mut spill = MemorySpill::new();
        spill.store(b"a").unwrap();
        spill.clear().unwrap();
        assert!(spill.load(0).is_err());

        spill.store(b"b").unwrap();
        assert_eq!(spill.load(0).unwrap(), b"b");
    }
}
