//! Free-map: a persistent bitmap of allocated sectors.
//!
//! One bit per device sector, set while the sector is in use. The bitmap is
//! kept in memory and persisted inside an ordinary inode-backed file whose
//! record lives at `FREE_MAP_SECTOR`; `allocate` and `release` write the
//! touched bitmap bytes through to that file so the map survives a crash of
//! everything above the cache.

use std::sync::{Arc, Mutex};

use itertools::Itertools;

use crate::error::{FsError, Result};
use crate::fs::{inode, FsCore};
use crate::fs::inode::Inode;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub(crate) struct Freemap {
    inner: Mutex<FreemapInner>,
}

struct FreemapInner {
    /// One bit per sector, LSB-first within each byte.
    bits: Vec<u8>,
    bit_cnt: u32,
    /// Backing file, open from mount until `close`.
    file: Option<Arc<Inode>>,
}

impl FreemapInner {
    fn test(&self, idx: u32) -> bool {
        self.bits[idx as usize / 8] & (1 << (idx % 8)) != 0
    }

    fn set(&mut self, idx: u32, used: bool) {
        if used {
            self.bits[idx as usize / 8] |= 1 << (idx % 8);
        } else {
            self.bits[idx as usize / 8] &= !(1 << (idx % 8));
        }
    }

    /// First-fit scan for `count` consecutive free sectors.
    fn scan(&self, count: usize) -> Option<u32> {
        if count == 1 {
            // Fast path for the single-sector allocations the inode layer
            // makes: skip whole bytes of allocated sectors.
            let (byte_idx, &byte) = self.bits.iter().find_position(|&&b| b != 0xff)?;
            let idx = byte_idx as u32 * 8 + (!byte).trailing_zeros();
            return if idx < self.bit_cnt { Some(idx) } else { None };
        }
        let mut run = 0;
        let mut start = 0;
        for idx in 0..self.bit_cnt {
            if self.test(idx) {
                run = 0;
            } else {
                if run == 0 {
                    start = idx;
                }
                run += 1;
                if run == count {
                    return Some(start);
                }
            }
        }
        None
    }

    /// Writes the bitmap bytes covering sectors `[first, first + count)`
    /// through to the backing file, if it is open yet.
    fn write_through(&self, fs: &FsCore, first: u32, count: usize) -> Result<()> {
        if let Some(file) = self.file.clone() {
            let lo = first as usize / 8;
            let hi = (first as usize + count - 1) / 8;
            let written = file.write_at(fs, &self.bits[lo..=hi], lo as u64)?;
            if written != hi - lo + 1 {
                return Err(FsError::Io);
            }
        }
        Ok(())
    }
}

impl Freemap {
    /// A fresh map for a `sectors`-sector device, with the map's own home
    /// sector and the root directory sector pre-reserved.
    pub(crate) fn new(sectors: u32) -> Self {
        let mut inner = FreemapInner {
            bits: vec![0; (sectors as usize + 7) / 8],
            bit_cnt: sectors,
            file: None,
        };
        inner.set(FREE_MAP_SECTOR, true);
        inner.set(ROOT_DIR_SECTOR, true);
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Format-time bootstrap: creates the backing file at `FREE_MAP_SECTOR`
    /// and persists the current map into it. The file's own data sectors are
    /// allocated from the map being written, which is why the file handle is
    /// installed only after the record exists.
    pub(crate) fn create(&self, fs: &FsCore) -> Result<()> {
        let bytes = self.inner.lock().unwrap().bits.len();
        inode::create(fs, FREE_MAP_SECTOR, bytes as u32, false)?;
        let file = inode::open(fs, FREE_MAP_SECTOR)?;
        let mut inner = self.inner.lock().unwrap();
        inner.file = Some(file);
        inner.write_through(fs, 0, inner.bit_cnt as usize)
    }

    /// Reads the persisted map back from its file.
    pub(crate) fn open(&self, fs: &FsCore) -> Result<()> {
        let file = inode::open(fs, FREE_MAP_SECTOR)?;
        let mut bits = vec![0u8; self.inner.lock().unwrap().bits.len()];
        let read = file.read_at(fs, &mut bits, 0)?;
        if read != bits.len() {
            inode::close(fs, file)?;
            return Err(FsError::Corrupted("short free-map file"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.bits = bits;
        inner.file = Some(file);
        Ok(())
    }

    /// Persists the map and closes its backing file. A no-op when the file
    /// is not open, so teardown paths may call it unconditionally.
    pub(crate) fn close(&self, fs: &FsCore) -> Result<()> {
        let (file, bits) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.file.take(), inner.bits.clone())
        };
        if let Some(file) = file {
            let written = file.write_at(fs, &bits, 0)?;
            inode::close(fs, file)?;
            if written != bits.len() {
                return Err(FsError::Io);
            }
        }
        Ok(())
    }

    /// Reserves `count` consecutive sectors and returns the first id.
    pub(crate) fn allocate(&self, fs: &FsCore, count: usize) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let first = inner.scan(count).ok_or(FsError::NoSpace)?;
        for idx in first..first + count as u32 {
            inner.set(idx, true);
        }
        inner.write_through(fs, first, count)?;
        Ok(first)
    }

    /// Returns `count` sectors starting at `first` to the free pool.
    pub(crate) fn release(&self, fs: &FsCore, first: u32, count: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for idx in first..first + count as u32 {
            debug_assert!(inner.test(idx), "releasing free sector {}", idx);
            inner.set(idx, false);
        }
        inner.write_through(fs, first, count)
    }

    /// Number of unallocated sectors.
    pub(crate) fn free_count(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        (0..inner.bit_cnt).filter(|&idx| !inner.test(idx)).count() as u32
    }
}
