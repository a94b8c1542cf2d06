//! Block devices.
//!
//! A block device exposes a fixed number of `SECTOR_SIZE` sectors with
//! sector-granular random access. Both transfer directions block and are
//! assumed durable on return. Everything above this layer reaches sectors
//! through the buffer cache, never through a device directly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{FsError, Result};
use crate::param::SECTOR_SIZE;

/// One sector of data.
pub type Sector = [u8; SECTOR_SIZE];

pub trait BlockDevice: Send + Sync {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read_sector(&self, sector: u32, buf: &mut Sector) -> Result<()>;

    /// Writes `buf` to sector `sector`.
    fn write_sector(&self, sector: u32, buf: &Sector) -> Result<()>;
}

/// An in-memory disk. The backing store is a flat byte vector, which makes
/// formatting and scenario tests cheap and deterministic.
pub struct MemDisk {
    sectors: u32,
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0; sectors as usize * SECTOR_SIZE]),
        }
    }

    /// Snapshot of the raw device contents, for state comparisons.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&self, sector: u32, buf: &mut Sector) -> Result<()> {
        if sector >= self.sectors {
            return Err(FsError::Io);
        }
        let data = self.data.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &Sector) -> Result<()> {
        if sector >= self.sectors {
            return Err(FsError::Io);
        }
        let mut data = self.data.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

/// A disk backed by an image file on the host filesystem.
pub struct FileDisk {
    sectors: u32,
    file: Mutex<File>,
}

impl FileDisk {
    /// Opens an existing image. The image length must be a whole number of
    /// sectors.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| FsError::Io)?;
        let len = file.metadata().map_err(|_| FsError::Io)?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(FsError::Corrupted("image not sector aligned"));
        }
        Ok(Self {
            sectors: (len / SECTOR_SIZE as u64) as u32,
            file: Mutex::new(file),
        })
    }

    /// Creates a zero-filled image of `sectors` sectors, truncating any
    /// existing file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, sectors: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| FsError::Io)?;
        file.set_len(sectors as u64 * SECTOR_SIZE as u64)
            .map_err(|_| FsError::Io)?;
        Ok(Self {
            sectors,
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&self, sector: u32, buf: &mut Sector) -> Result<()> {
        if sector >= self.sectors {
            return Err(FsError::Io);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .map_err(|_| FsError::Io)?;
        file.read_exact(buf).map_err(|_| FsError::Io)
    }

    fn write_sector(&self, sector: u32, buf: &Sector) -> Result<()> {
        if sector >= self.sectors {
            return Err(FsError::Io);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .map_err(|_| FsError::Io)?;
        file.write_all(buf).map_err(|_| FsError::Io)
    }
}
