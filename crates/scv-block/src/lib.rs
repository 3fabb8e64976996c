#![forbid(unsafe_code)]
//! Read-only device access.
//!
//! Recovery never writes to the source device, so this layer only knows how
//! to read. The device is addressed by byte offset with pread semantics;
//! the scan loop on top reads whole blocks in one forward sweep.

use scv_error::{Result, ScvError};
use scv_types::SUPER_INFO_OFFSET_2;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Byte-addressed read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style positional I/O.
///
/// Opened read-only for shared use; multiple readers are safe.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), len, "opened device");
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device, used by tests and small captured images.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| ScvError::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                ScvError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of device",
                ))
            })?;
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// Validate that a device is big enough to plausibly hold a filesystem.
///
/// The minimum filesystem size is 64 MiB; the second superblock copy plus a
/// small margin must fit.
pub fn check_device_size(len_bytes: u64, block_size: u64) -> Result<()> {
    if len_bytes < block_size || len_bytes < SUPER_INFO_OFFSET_2 + block_size * 100 {
        return Err(ScvError::DeviceTooSmall { size: len_bytes });
    }
    Ok(())
}

/// Sequential whole-block reader over a `ByteDevice`.
///
/// Iterates block-aligned offsets in `[start, end)` where `end` is the last
/// whole block. Hitting end-of-file mid-device (shorter than its reported
/// length) ends the sweep cleanly; any other I/O error is fatal.
pub struct BlockScanner<'a> {
    dev: &'a dyn ByteDevice,
    block_size: u64,
    offset: u64,
    end: u64,
}

impl<'a> BlockScanner<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn ByteDevice, block_size: u64, start: u64) -> Self {
        let end = dev.len_bytes() - (dev.len_bytes() % block_size);
        Self {
            dev,
            block_size,
            offset: start,
            end,
        }
    }

    /// Total number of bytes the sweep will cover.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Read the next block into `buf`, returning its device offset, or
    /// `None` once the sweep is done. `buf.len()` must equal the block size.
    pub fn next_block(&mut self, buf: &mut [u8]) -> Result<Option<u64>> {
        if self.offset >= self.end {
            return Ok(None);
        }
        let offset = self.offset;
        match self.dev.read_exact_at(offset, buf) {
            Ok(()) => {
                self.offset += self.block_size;
                Ok(Some(offset))
            }
            Err(ScvError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.offset = self.end;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
