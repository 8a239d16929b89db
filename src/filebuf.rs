//! Buffered save-file handle.
//!
//! Thin wrapper over [`std::fs::File`] with write buffering, absolute
//! tell/seek, and delete-on-close semantics: a save in progress keeps the
//! flag set so an aborted or failed save leaves no partial file behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

const WRITE_BUF_MAX: usize = 1 << 20;

/// Buffered file handle for save files.
pub struct FileBuf {
    file: File,
    path: PathBuf,
    write_buf: Vec<u8>,
    delete_on_close: bool,
}

impl FileBuf {
    /// Create (truncate) a save file for writing; readable after
    /// [`FileBuf::flush`] for the in-place restore-memory pass.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            write_buf: Vec::new(),
            delete_on_close: false,
        })
    }

    /// Open an existing save file read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            file,
            path,
            write_buf: Vec::new(),
            delete_on_close: false,
        })
    }

    /// Open a second independent read handle on the same file; used by the
    /// lazy-load subsystem, which outlives the load pass.
    pub fn reopen(&self) -> io::Result<Self> {
        Self::open(&self.path)
    }

    /// Path this handle was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arm or disarm deletion of the file when this handle drops.
    pub fn set_delete_on_close(&mut self, delete: bool) {
        self.delete_on_close = delete;
    }

    /// Current absolute position, counting buffered unwritten bytes.
    pub fn tell(&mut self) -> io::Result<u64> {
        Ok(self.file.stream_position()? + self.write_buf.len() as u64)
    }

    /// Flush buffered writes and seek.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.flush()?;
        self.file.seek(pos)
    }

    /// Append bytes through the write buffer.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.write_buf.len() + buf.len() > WRITE_BUF_MAX {
            self.flush()?;
        }
        if buf.len() >= WRITE_BUF_MAX {
            self.file.write_all(buf)
        } else {
            self.write_buf.extend_from_slice(buf);
            Ok(())
        }
    }

    /// Flush buffered writes to the file.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            self.file.write_all(&self.write_buf)?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at the current position.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.flush()?;
        self.file.read_exact(buf)
    }

    /// File size in bytes.
    pub fn len(&mut self) -> io::Result<u64> {
        self.flush()?;
        Ok(self.file.metadata()?.len())
    }

    /// Write a little-endian i32.
    pub fn write_i32(&mut self, v: i32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Write a little-endian u16.
    pub fn write_u16(&mut self, v: u16) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Write a little-endian u64.
    pub fn write_u64(&mut self, v: u64) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Read a little-endian i32.
    pub fn read_i32(&mut self) -> io::Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Drop for FileBuf {
    fn drop(&mut self) {
        let _ = self.flush();
        if self.delete_on_close {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e,
                      "failed to delete incomplete save file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.save");

        let mut f = FileBuf::create(&path).unwrap();
        f.write_i32(-16).unwrap();
        f.write_u32(4).unwrap();
        f.write_u64(0xabcd).unwrap();
        assert_eq!(f.tell().unwrap(), 16);

        f.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(f.read_i32().unwrap(), -16);
        assert_eq!(f.read_u32().unwrap(), 4);
        assert_eq!(f.read_u64().unwrap(), 0xabcd);
    }

    #[test]
    fn tell_counts_buffered_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.save");

        let mut f = FileBuf::create(&path).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        // Nothing flushed yet, position still includes the buffered bytes.
        assert_eq!(f.tell().unwrap(), 3);
    }

    #[test]
    fn delete_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.save");

        let mut f = FileBuf::create(&path).unwrap();
        f.write_u32(1).unwrap();
        f.set_delete_on_close(true);
        drop(f);
        assert!(!path.exists());
    }

    #[test]
    fn keep_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.save");

        let mut f = FileBuf::create(&path).unwrap();
        f.write_u32(1).unwrap();
        f.set_delete_on_close(true);
        f.set_delete_on_close(false);
        drop(f);
        assert!(path.exists());
    }
}
