//! File-backed byte channels.
//!
//! Each channel has one writer appending to a file and one reader following
//! it from its own offset. Reads only ever consume what is already on disk.

use std::fs::{File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Follows a file that another process appends to.
#[derive(Debug)]
pub struct ChannelReader {
    file: File,
    path: PathBuf,
    position: u64,
}

impl ChannelReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            path: path.to_path_buf(),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of the open file, which may no longer be the one at `path`.
    pub fn metadata(&self) -> io::Result<Metadata> {
        self.file.metadata()
    }

    /// Bytes written by the peer and not read yet.
    pub fn available(&self) -> io::Result<u64> {
        let len = self.metadata()?.len();
        Ok(len.saturating_sub(self.position))
    }

    /// Read up to `buf.len()` of the available bytes. Returns 0 when the
    /// peer has not written anything new.
    pub fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.available()?;
        if available == 0 || buf.is_empty() {
            return Ok(0);
        }

        let limit = usize::try_from(available).map_or(buf.len(), |n| n.min(buf.len()));
        let count = self.file.read(&mut buf[..limit])?;
        self.position += count as u64;
        Ok(count)
    }
}

/// Appends to a channel file.
#[derive(Debug)]
pub struct ChannelWriter {
    file: File,
    path: PathBuf,
}

impl ChannelWriter {
    /// Open an existing channel.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Create the channel if needed and open it for appending.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()
    }
}
