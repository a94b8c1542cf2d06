//! Open descriptors.
//!
//! An open descriptor is either a regular file or a directory, and every
//! descriptor-level operation dispatches on that tag: reads, writes, and
//! seeking belong to files, `readdir` to directories, and `inumber`/`is_dir`
//! to both. A `File` adds a byte cursor and an optional deny-write
//! registration on top of its inode reference; a directory descriptor is the
//! directory layer's `Dir`, whose cursor drives `readdir`.

use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::fs::dir::FileName;
use crate::fs::inode::{self, Inode};
use crate::fs::{Dir, FsCore};

/// An open regular file.
pub struct File {
    ino: Arc<Inode>,
    pos: u64,
    denied: bool,
}

impl File {
    pub(crate) fn new(ino: Arc<Inode>) -> File {
        File {
            ino,
            pos: 0,
            denied: false,
        }
    }

    pub fn inumber(&self) -> u32 {
        self.ino.inumber()
    }

    pub fn size(&self) -> u64 {
        self.ino.length()
    }

    /// Reads from the cursor, advancing it by the bytes actually read.
    pub fn read(&mut self, fs: &FsCore, buf: &mut [u8]) -> Result<usize> {
        let n = self.ino.read_at(fs, buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Writes at the cursor, advancing it by the bytes actually written.
    pub fn write(&mut self, fs: &FsCore, buf: &[u8]) -> Result<usize> {
        let n = self.ino.write_at(fs, buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn read_at(&self, fs: &FsCore, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.ino.read_at(fs, buf, offset)
    }

    pub fn write_at(&self, fs: &FsCore, buf: &[u8], offset: u64) -> Result<usize> {
        self.ino.write_at(fs, buf, offset)
    }

    /// Moves the cursor to an absolute byte offset. Seeking past end-of-file
    /// is allowed; a later write there extends the file.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Denies writes to the underlying inode until `allow_write` or close.
    /// At most one registration per open file.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.ino.deny_write();
        }
    }

    /// Drops this file's deny-write registration, if any.
    pub fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.ino.allow_write();
        }
    }

    /// Releases the inode reference, dropping any deny-write registration
    /// first.
    pub fn close(mut self, fs: &FsCore) -> Result<()> {
        self.allow_write();
        inode::close(fs, self.ino)
    }
}

/// An open descriptor: a regular file or a directory.
pub enum Desc {
    File(File),
    Dir(Dir),
}

impl Desc {
    pub fn is_dir(&self) -> bool {
        matches!(self, Desc::Dir(_))
    }

    pub fn inumber(&self) -> u32 {
        match self {
            Desc::File(file) => file.inumber(),
            Desc::Dir(dir) => dir.inumber(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Desc::File(file) => file.size(),
            Desc::Dir(dir) => dir.inode().length(),
        }
    }

    /// Reads from a file descriptor; directories refuse.
    pub fn read(&mut self, fs: &FsCore, buf: &mut [u8]) -> Result<usize> {
        match self {
            Desc::File(file) => file.read(fs, buf),
            Desc::Dir(_) => Err(FsError::InvalidArg),
        }
    }

    /// Writes to a file descriptor; directories refuse.
    pub fn write(&mut self, fs: &FsCore, buf: &[u8]) -> Result<usize> {
        match self {
            Desc::File(file) => file.write(fs, buf),
            Desc::Dir(_) => Err(FsError::InvalidArg),
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        match self {
            Desc::File(file) => {
                file.seek(pos);
                Ok(())
            }
            Desc::Dir(_) => Err(FsError::InvalidArg),
        }
    }

    pub fn tell(&self) -> Result<u64> {
        match self {
            Desc::File(file) => Ok(file.tell()),
            Desc::Dir(_) => Err(FsError::InvalidArg),
        }
    }

    /// Emits the next entry name of a directory descriptor, skipping `.`
    /// and `..`; files refuse.
    pub fn readdir(&mut self, fs: &FsCore) -> Result<Option<FileName>> {
        match self {
            Desc::File(_) => Err(FsError::InvalidArg),
            Desc::Dir(dir) => dir.readdir(fs),
        }
    }

    pub fn close(self, fs: &FsCore) -> Result<()> {
        match self {
            Desc::File(file) => file.close(fs),
            Desc::Dir(dir) => dir.close(fs),
        }
    }
}
