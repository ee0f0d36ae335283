#![forbid(unsafe_code)]
//! Host-file random-access I/O for MonoFS images.
//!
//! `ImageFile` wraps a `std::fs::File` with pread/pwrite style
//! offset-addressed access, so no seek cursor is shared between reads and
//! writes. Reads past end-of-file come back short; writes and resizes are
//! refused on a read-only handle.

use mfs_error::{FsError, Result};
use mfs_types::ByteOffset;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace};

/// How to open the backing image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// The file must already exist; writes and resizes are refused.
    Read,
    /// The file is created when absent.
    ReadWrite,
}

/// An open filesystem image on the host.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    writable: bool,
}

impl ImageFile {
    /// Open an image file in the given mode.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = match mode {
            OpenMode::Read => {
                if !path.exists() {
                    return Err(FsError::FileDoesNotExist(path.display().to_string()));
                }
                let file = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map_err(|err| FsError::CouldNotOpenFile(format!("{}: {err}", path.display())))?;
                (file, false)
            }
            OpenMode::ReadWrite => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(|err| FsError::CouldNotOpenFile(format!("{}: {err}", path.display())))?;
                (file, true)
            }
        };

        debug!(
            target: "mfs::image",
            event = "open",
            path = %path.display(),
            writable,
        );
        Ok(Self { file, writable })
    }

    /// Current length of the image in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the image currently holds zero bytes.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read up to `len` bytes at `offset`. The returned buffer is shorter
    /// than `len` when end-of-file is reached first.
    pub fn read_bytes(&self, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        let mut filled = 0_usize;
        while filled < len {
            let pos = offset
                .checked_add(filled as u64)
                .ok_or_else(|| FsError::FileRead("read range overflows u64".to_owned()))?;
            let n = self.file.read_at(&mut buf[filled..], pos.0)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        trace!(
            target: "mfs::image",
            event = "read",
            offset = offset.0,
            requested = len,
            got = filled,
        );
        Ok(buf)
    }

    /// Write all of `data` at `offset`, extending the file if needed.
    pub fn write_bytes(&self, offset: ByteOffset, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsError::FileReadOnly);
        }
        offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::FileWrite("write range overflows u64".to_owned()))?;
        self.file.write_all_at(data, offset.0)?;
        trace!(
            target: "mfs::image",
            event = "write",
            offset = offset.0,
            len = data.len(),
        );
        Ok(())
    }

    /// Resize the image to exactly `new_len` bytes and zero-fill it.
    ///
    /// Truncating to zero first guarantees that every byte of the resized
    /// file reads back as zero, which format relies on.
    pub fn resize(&self, new_len: u64) -> Result<u64> {
        if !self.writable {
            return Err(FsError::FileReadOnly);
        }
        self.file
            .set_len(0)
            .and_then(|()| self.file.set_len(new_len))
            .map_err(|err| FsError::CouldNotResizeImage(err.to_string()))?;
        debug!(target: "mfs::image", event = "resize", new_len);
        Ok(new_len)
    }

    /// Flush pending writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
