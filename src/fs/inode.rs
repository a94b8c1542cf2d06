//! Inodes.
//!
//! An inode describes a single file or directory. The on-disk record holds
//! the file's length, its type, the sector of its containing directory, and
//! the block pointer tree: ten direct sectors, one single-indirect sector of
//! 128 pointers, and one double-indirect sector of 128 single-indirect
//! pointers. The record is exactly one sector and lives at the inode's home
//! sector; a file is named by that sector id.
//!
//! The crate keeps a table of in-use inodes in memory to provide a place for
//! synchronizing access to inodes used by multiple threads. At most one
//! in-memory `Inode` exists per home sector; `open` either bumps the opener
//! count of the table entry or installs a new one, and the last `close`
//! writes the record back, reclaims the block tree if the inode was removed,
//! and drops the entry.
//!
//! All sector traffic goes through the buffer cache. Partial-sector reads
//! and writes bounce through a one-sector scratch buffer; whole sectors move
//! directly between the cache and the caller's buffer.

use core::mem;
use std::sync::{Arc, Mutex};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, Result};
use crate::fs::FsCore;
use crate::param::{
    MAXFILE_BYTES, MAXFILE_SECTORS, NDIRECT, NINDIRECT, ROOT_DIR_SECTOR, SECTOR_SIZE,
};

/// Identifies an inode record.
pub const INODE_MAGIC: u32 = 0x43484c4b;

/// Returns the number of sectors needed to hold `bytes` bytes.
pub(crate) fn bytes_to_sectors(bytes: u32) -> usize {
    (bytes as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// On-disk inode record. Must be exactly one sector long.
#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
pub struct Dinode {
    /// Sector ids: indices `0..NDIRECT` are direct data sectors, index
    /// `NDIRECT` is the single-indirect sector, index `NDIRECT + 1` the
    /// double-indirect sector.
    pub blocks: [u32; NDIRECT + 2],
    /// Allocated direct entries, `0..=NDIRECT`.
    pub direct_usage: u32,
    /// Whether the single-indirect sector is allocated.
    pub indirect_used: u32,
    /// Allocated entries within the single-indirect sector, `0..=NINDIRECT`.
    pub indirect_block_usage: u32,
    /// Whether the double-indirect sector is allocated.
    pub double_used: u32,
    /// Completed second-level sectors under the double-indirect sector.
    pub double_l1_usage: u32,
    /// Allocated entries within the current second-level sector.
    pub double_l2_usage: u32,
    /// Total allocated data sectors.
    pub sector_usage: u32,
    /// File size in bytes; the authoritative end-of-file marker.
    pub length: u32,
    pub magic: u32,
    pub is_dir: u32,
    /// Home sector of the containing directory's inode.
    pub parent: u32,
    unused: [u8; 420],
}

const_assert!(mem::size_of::<Dinode>() == SECTOR_SIZE);

impl Dinode {
    fn new(length: u32, is_dir: bool) -> Self {
        Self {
            blocks: [0; NDIRECT + 2],
            direct_usage: 0,
            indirect_used: 0,
            indirect_block_usage: 0,
            double_used: 0,
            double_l1_usage: 0,
            double_l2_usage: 0,
            sector_usage: 0,
            length,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            parent: ROOT_DIR_SECTOR,
            unused: [0; 420],
        }
    }
}

/// One sector's worth of sector ids, the payload of an indirection sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct IndirectBlock {
    pub entries: [u32; NINDIRECT],
}

const_assert!(mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    fn zeroed() -> Self {
        Self {
            entries: [0; NINDIRECT],
        }
    }
}

/// In-memory inode.
#[derive(Debug)]
pub struct Inode {
    sector: u32,
    pub(crate) state: Mutex<InodeState>,
}

#[derive(Debug)]
pub(crate) struct InodeState {
    pub open_cnt: u32,
    pub removed: bool,
    pub deny_write_cnt: u32,
    /// Copy of the on-disk record. Written back at last close.
    pub disk: Dinode,
}

/// Table of open inodes, so that opening a single inode twice returns the
/// same `Inode`.
pub(crate) struct Itable {
    inodes: Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            inodes: Mutex::new(Vec::new()),
        }
    }
}

/// Builds a fresh record with `length` bytes of zeroed data and writes it to
/// `sector` through the cache. Data sectors allocated by the growth pass are
/// released again if the pass runs out of space.
pub(crate) fn create(fs: &FsCore, sector: u32, length: u32, is_dir: bool) -> Result<()> {
    if length as u64 > MAXFILE_BYTES {
        return Err(FsError::NoSpace);
    }
    let mut disk = Dinode::new(length, is_dir);
    grow(fs, &mut disk)?;
    fs.cache.write(&fs.dev, sector, disk.as_bytes())
}

/// Returns the in-memory inode for `sector`, installing one if none exists.
pub(crate) fn open(fs: &FsCore, sector: u32) -> Result<Arc<Inode>> {
    let mut inodes = fs.itable.inodes.lock().unwrap();
    if let Some(ino) = inodes.iter().find(|i| i.sector == sector) {
        ino.state.lock().unwrap().open_cnt += 1;
        return Ok(Arc::clone(ino));
    }

    let mut disk = Dinode::new(0, false);
    fs.cache.read(&fs.dev, sector, disk.as_bytes_mut())?;
    if disk.magic != INODE_MAGIC {
        return Err(FsError::Corrupted("bad inode magic"));
    }
    let ino = Arc::new(Inode {
        sector,
        state: Mutex::new(InodeState {
            open_cnt: 1,
            removed: false,
            deny_write_cnt: 0,
            disk,
        }),
    });
    inodes.push(Arc::clone(&ino));
    Ok(ino)
}

/// Drops one reference. The last close writes the record back and, if the
/// inode was removed, releases its block tree and its home sector.
pub(crate) fn close(fs: &FsCore, ino: Arc<Inode>) -> Result<()> {
    let mut inodes = fs.itable.inodes.lock().unwrap();
    let mut st = ino.state.lock().unwrap();
    st.open_cnt -= 1;
    if st.open_cnt > 0 {
        return Ok(());
    }
    inodes.retain(|i| i.sector != ino.sector);
    fs.cache.write(&fs.dev, ino.sector, st.disk.as_bytes())?;
    if st.removed {
        free(fs, &st.disk)?;
        fs.freemap.release(fs, ino.sector, 1)?;
    }
    Ok(())
}

/// Marks the inode for deletion at its last close.
pub(crate) fn remove(ino: &Inode) {
    ino.state.lock().unwrap().removed = true;
}

/// Rewrites the parent pointer of the inode at `child`.
pub(crate) fn set_parent(fs: &FsCore, parent: u32, child: u32) -> Result<()> {
    let ino = open(fs, child)?;
    ino.state.lock().unwrap().disk.parent = parent;
    close(fs, ino)
}

impl Inode {
    /// Home sector; doubles as the inode number.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> u64 {
        self.state.lock().unwrap().disk.length as u64
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().unwrap().disk.is_dir != 0
    }

    /// Home sector of the containing directory.
    pub fn parent(&self) -> u32 {
        self.state.lock().unwrap().disk.parent
    }

    /// Takes another reference to this inode.
    pub(crate) fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.state.lock().unwrap().open_cnt += 1;
        Arc::clone(self)
    }

    /// Disables writes. Calls must be balanced with `allow_write`, at most
    /// one outstanding pair per opener.
    pub fn deny_write(&self) {
        let mut st = self.state.lock().unwrap();
        st.deny_write_cnt += 1;
        debug_assert!(st.deny_write_cnt <= st.open_cnt);
    }

    /// Re-enables writes previously denied by this opener.
    pub fn allow_write(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.deny_write_cnt > 0);
        st.deny_write_cnt -= 1;
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes actually copied; a short count means end-of-file was
    /// reached mid-range. Never extends the file.
    pub fn read_at(&self, fs: &FsCore, buf: &mut [u8], offset: u64) -> Result<usize> {
        let st = self.state.lock().unwrap();
        let length = st.disk.length as u64;
        let mut offset = offset;
        let mut bytes_read = 0;
        let mut bounce: Option<Box<[u8; SECTOR_SIZE]>> = None;

        while bytes_read < buf.len() {
            let sector = match byte_to_sector(fs, &st.disk, offset)? {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;

            // Bytes left in the file, bytes left in the sector, lesser of
            // the two; then no more than the caller asked for.
            let inode_left = (length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_read).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                fs.cache
                    .read(&fs.dev, sector, &mut buf[bytes_read..bytes_read + SECTOR_SIZE])?;
            } else {
                let bounce = bounce.get_or_insert_with(|| Box::new([0; SECTOR_SIZE]));
                fs.cache.read(&fs.dev, sector, &mut bounce[..])?;
                buf[bytes_read..bytes_read + chunk]
                    .copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }

            offset += chunk as u64;
            bytes_read += chunk;
        }
        Ok(bytes_read)
    }

    /// Writes `buf` starting at byte `offset`, extending the file first when
    /// the range ends past the current length. Returns the number of bytes
    /// written, which is zero while writes are denied.
    pub fn write_at(&self, fs: &FsCore, buf: &[u8], offset: u64) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.deny_write_cnt > 0 {
            return Ok(0);
        }

        let end = offset + buf.len() as u64;
        if end > st.disk.length as u64 {
            if end > MAXFILE_BYTES {
                return Err(FsError::NoSpace);
            }
            let saved = st.disk;
            st.disk.length = end as u32;
            if let Err(e) = grow(fs, &mut st.disk) {
                st.disk = saved;
                return Err(e);
            }
        }

        let length = st.disk.length as u64;
        let mut offset = offset;
        let mut bytes_written = 0;
        let mut bounce: Option<Box<[u8; SECTOR_SIZE]>> = None;

        while bytes_written < buf.len() {
            let sector = match byte_to_sector(fs, &st.disk, offset)? {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;

            let inode_left = (length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                fs.cache
                    .write(&fs.dev, sector, &buf[bytes_written..bytes_written + SECTOR_SIZE])?;
            } else {
                let bounce = bounce.get_or_insert_with(|| Box::new([0; SECTOR_SIZE]));
                // If the sector holds file bytes outside the chunk, fetch it
                // first; otherwise start from zeros.
                if sector_ofs > 0 || chunk < sector_left {
                    fs.cache.read(&fs.dev, sector, &mut bounce[..])?;
                } else {
                    bounce.fill(0);
                }
                bounce[sector_ofs..sector_ofs + chunk]
                    .copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
                fs.cache.write(&fs.dev, sector, &bounce[..])?;
            }

            offset += chunk as u64;
            bytes_written += chunk;
        }
        Ok(bytes_written)
    }
}

/// Returns the sector holding byte `pos`, or `None` past end-of-file.
pub(crate) fn byte_to_sector(fs: &FsCore, d: &Dinode, pos: u64) -> Result<Option<u32>> {
    if pos >= d.length as u64 {
        return Ok(None);
    }
    let pos = pos as usize;
    if pos < NDIRECT * SECTOR_SIZE {
        return Ok(Some(d.blocks[pos / SECTOR_SIZE]));
    }
    let p = pos - NDIRECT * SECTOR_SIZE;
    if p < NINDIRECT * SECTOR_SIZE {
        let mut ind = IndirectBlock::zeroed();
        fs.cache.read(&fs.dev, d.blocks[NDIRECT], ind.as_bytes_mut())?;
        return Ok(Some(ind.entries[p / SECTOR_SIZE]));
    }
    let q = p - NINDIRECT * SECTOR_SIZE;
    let row = q / (NINDIRECT * SECTOR_SIZE);
    let mut l1 = IndirectBlock::zeroed();
    fs.cache
        .read(&fs.dev, d.blocks[NDIRECT + 1], l1.as_bytes_mut())?;
    let mut l2 = IndirectBlock::zeroed();
    fs.cache.read(&fs.dev, l1.entries[row], l2.as_bytes_mut())?;
    Ok(Some(
        l2.entries[(q % (NINDIRECT * SECTOR_SIZE)) / SECTOR_SIZE],
    ))
}

/// Allocates and zero-fills data sectors until `sector_usage` covers
/// `length`, filling direct slots first, then the single-indirect sector,
/// then the double-indirect tree. Indirection sectors are allocated lazily on
/// first use and rewritten at the end of each pass. If the free-map runs dry
/// every sector taken by this call is released again; the caller restores the
/// record from its own snapshot.
pub(crate) fn grow(fs: &FsCore, d: &mut Dinode) -> Result<()> {
    let target = bytes_to_sectors(d.length);
    if target > MAXFILE_SECTORS {
        return Err(FsError::NoSpace);
    }
    let mut remain = target.saturating_sub(d.sector_usage as usize);
    if remain == 0 {
        return Ok(());
    }

    let mut allocated = Vec::new();
    let res = grow_inner(fs, d, &mut remain, &mut allocated);
    if res.is_err() {
        for &sector in allocated.iter().rev() {
            let _ = fs.freemap.release(fs, sector, 1);
        }
    }
    res
}

fn balloc(fs: &FsCore, allocated: &mut Vec<u32>) -> Result<u32> {
    let sector = fs.freemap.allocate(fs, 1)?;
    allocated.push(sector);
    Ok(sector)
}

fn grow_inner(
    fs: &FsCore,
    d: &mut Dinode,
    remain: &mut usize,
    allocated: &mut Vec<u32>,
) -> Result<()> {
    let zeros = [0u8; SECTOR_SIZE];
    while *remain > 0 {
        if (d.direct_usage as usize) < NDIRECT {
            let sector = balloc(fs, allocated)?;
            fs.cache.write(&fs.dev, sector, &zeros)?;
            d.blocks[d.direct_usage as usize] = sector;
            d.direct_usage += 1;
            d.sector_usage += 1;
            *remain -= 1;
        } else if (d.indirect_block_usage as usize) < NINDIRECT {
            let mut ind = IndirectBlock::zeroed();
            if d.indirect_block_usage > 0 {
                fs.cache.read(&fs.dev, d.blocks[NDIRECT], ind.as_bytes_mut())?;
            } else {
                d.blocks[NDIRECT] = balloc(fs, allocated)?;
            }
            let mut i = d.indirect_block_usage as usize;
            while i < NINDIRECT && *remain > 0 {
                let sector = balloc(fs, allocated)?;
                fs.cache.write(&fs.dev, sector, &zeros)?;
                ind.entries[i] = sector;
                d.indirect_block_usage += 1;
                d.sector_usage += 1;
                *remain -= 1;
                i += 1;
            }
            fs.cache.write(&fs.dev, d.blocks[NDIRECT], ind.as_bytes())?;
            d.indirect_used = 1;
        } else {
            let mut l1 = IndirectBlock::zeroed();
            if d.double_used == 1 {
                fs.cache
                    .read(&fs.dev, d.blocks[NDIRECT + 1], l1.as_bytes_mut())?;
            } else {
                d.blocks[NDIRECT + 1] = balloc(fs, allocated)?;
            }
            let mut row = d.double_l1_usage as usize;
            while row < NINDIRECT && *remain > 0 {
                let mut l2 = IndirectBlock::zeroed();
                // A nonzero second-level count means this row already exists
                // on disk; otherwise start a fresh one.
                if d.double_l2_usage > 0 {
                    fs.cache.read(&fs.dev, l1.entries[row], l2.as_bytes_mut())?;
                } else {
                    l1.entries[row] = balloc(fs, allocated)?;
                }
                let mut j = d.double_l2_usage as usize;
                while j < NINDIRECT && *remain > 0 {
                    let sector = balloc(fs, allocated)?;
                    fs.cache.write(&fs.dev, sector, &zeros)?;
                    l2.entries[j] = sector;
                    d.double_l2_usage += 1;
                    d.sector_usage += 1;
                    *remain -= 1;
                    if j == NINDIRECT - 1 {
                        // A filled second-level sector closes out the row.
                        d.double_l2_usage = 0;
                        d.double_l1_usage += 1;
                    }
                    j += 1;
                }
                fs.cache.write(&fs.dev, l1.entries[row], l2.as_bytes())?;
                row += 1;
            }
            fs.cache
                .write(&fs.dev, d.blocks[NDIRECT + 1], l1.as_bytes())?;
            d.double_used = 1;
        }
    }
    Ok(())
}

/// Releases every data sector in the block tree in reverse-allocation order,
/// then the indirection sectors. Driven entirely by the usage counters, so a
/// partially-allocated tree is handled too.
pub(crate) fn free(fs: &FsCore, d: &Dinode) -> Result<()> {
    for i in (0..d.direct_usage as usize).rev() {
        fs.freemap.release(fs, d.blocks[i], 1)?;
    }

    if d.indirect_used == 1 {
        let mut ind = IndirectBlock::zeroed();
        fs.cache.read(&fs.dev, d.blocks[NDIRECT], ind.as_bytes_mut())?;
        for i in (0..d.indirect_block_usage as usize).rev() {
            fs.freemap.release(fs, ind.entries[i], 1)?;
        }
        fs.freemap.release(fs, d.blocks[NDIRECT], 1)?;
    }

    if d.double_used == 1 {
        let mut l1 = IndirectBlock::zeroed();
        fs.cache
            .read(&fs.dev, d.blocks[NDIRECT + 1], l1.as_bytes_mut())?;
        let full_rows = d.double_l1_usage as usize;
        let partial = d.double_l2_usage as usize;
        if partial > 0 {
            let mut l2 = IndirectBlock::zeroed();
            fs.cache
                .read(&fs.dev, l1.entries[full_rows], l2.as_bytes_mut())?;
            for j in (0..partial).rev() {
                fs.freemap.release(fs, l2.entries[j], 1)?;
            }
            fs.freemap.release(fs, l1.entries[full_rows], 1)?;
        }
        for row in (0..full_rows).rev() {
            let mut l2 = IndirectBlock::zeroed();
            fs.cache.read(&fs.dev, l1.entries[row], l2.as_bytes_mut())?;
            for j in (0..NINDIRECT).rev() {
                fs.freemap.release(fs, l2.entries[j], 1)?;
            }
            fs.freemap.release(fs, l1.entries[row], 1)?;
        }
        fs.freemap.release(fs, d.blocks[NDIRECT + 1], 1)?;
    }
    Ok(())
}
