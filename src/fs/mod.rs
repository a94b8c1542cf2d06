//! File system implementation. Four layers:
//!   + Cache: sector buffer cache with write-back, periodic flushing, and
//!     read-ahead (`crate::bio`).
//!   + Files: inode records, block pointer tree, reading, writing, growth.
//!   + Directories: inodes with special contents (a list of other inodes!).
//!   + Names: paths like `/usr/notes/todo` for convenient naming.
//!
//! This module holds the facade that ties them together: formatting, the
//! root mount, and the path-level operations (`create`, `open`, `remove`,
//! `mkdir`), each of which resolves a path to a containing directory and a
//! leaf name before handing off to the directory and inode layers.
//!
//! On-disk layout: sector 0 is the free-map file's inode, sector 1 the root
//! directory's inode; every other sector is allocatable. Inode and data
//! sectors are indistinguishable by format, so identity comes from being
//! referenced by a directory.
//!
//! Lock order, outermost first: syscall gate, open-inode table, an inode's
//! state, the free-map (then the free-map file's inode), cache lines. A
//! thread holds at most one cache line except inside eviction, which takes
//! lines in ascending index order.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use log::info;
use scopeguard::ScopeGuard;

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::file::Desc;
use crate::param::{ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR};

pub mod dir;
pub mod freemap;
pub mod inode;

pub use dir::{Dir, Dirent, FileName};
pub use inode::Inode;

use dir::find_dir;
use freemap::Freemap;
use inode::Itable;

/// Shared filesystem state. Reached through [`FileSys`], which derefs here;
/// the inode and directory layers take it as their context parameter.
pub struct FsCore {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) cache: Arc<Bcache>,
    pub(crate) freemap: Freemap,
    pub(crate) itable: Itable,
    /// Working directory of every live session, keyed by session id. A
    /// directory present here refuses removal.
    pub(crate) cwds: Mutex<HashMap<u64, u32>>,
    pub(crate) next_session: AtomicU64,
    /// Coarse gate for the system-call surface.
    pub(crate) syscall_gate: Mutex<()>,
}

/// Handle to a mounted filesystem. Cheap to clone; the last clone shuts the
/// background workers down.
#[derive(Clone)]
pub struct FileSys(pub(crate) Arc<FsCore>);

impl Deref for FileSys {
    type Target = FsCore;

    fn deref(&self) -> &FsCore {
        &self.0
    }
}

impl FileSys {
    /// Mounts the filesystem on `dev`, formatting it first when `format` is
    /// set. Spawns the cache's background workers.
    pub fn new(dev: Arc<dyn BlockDevice>, format: bool) -> Result<FileSys> {
        let cache = Bcache::new();
        cache.start();
        let core = Arc::new(FsCore {
            freemap: Freemap::new(dev.sector_count()),
            dev,
            cache,
            itable: Itable::new(),
            cwds: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
            syscall_gate: Mutex::new(()),
        });
        if format {
            core.format()?;
        }
        core.mount()?;
        Ok(FileSys(core))
    }

    /// Creates a file of `initial_size` zeroed bytes at `path`, resolved
    /// from the root.
    pub fn create(&self, path: &str, initial_size: u32) -> Result<()> {
        self.0.create_at(ROOT_DIR_SECTOR, path, initial_size)
    }

    /// Opens the file or directory at `path`, resolved from the root.
    pub fn open(&self, path: &str) -> Result<Desc> {
        self.0.open_at(ROOT_DIR_SECTOR, path)
    }

    /// Removes the file or empty directory at `path`, resolved from the
    /// root.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.0.remove_at(ROOT_DIR_SECTOR, path)
    }

    /// Creates a directory at `path`, resolved from the root.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.0.mkdir_at(ROOT_DIR_SECTOR, path)
    }

    /// Writes any unwritten state: persists the free-map and flushes the
    /// cache. The filesystem is unusable afterwards.
    pub fn done(&self) -> Result<()> {
        self.0.freemap.close(&self.0)?;
        self.0.cache.flush()
    }
}

impl FsCore {
    fn format(&self) -> Result<()> {
        info!("formatting file system ({} sectors)", self.dev.sector_count());
        self.freemap.create(self)?;
        dir::create(self, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES)?;
        self.freemap.close(self)?;
        Ok(())
    }

    fn mount(&self) -> Result<()> {
        self.freemap.open(self)?;

        // Seed the root's `.` and `..`, both pointing at the root itself.
        // On every mount after the first they already exist.
        let root = Dir::open_root(self)?;
        let res = (|| {
            for name in [".", ".."] {
                match root.add(self, name, ROOT_DIR_SECTOR) {
                    Ok(()) | Err(FsError::NameExists) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })();
        root.close(self)?;
        res?;

        info!("mounted; {} sectors free", self.freemap.free_count());
        Ok(())
    }

    pub(crate) fn create_at(&self, cwd: u32, path: &str, initial_size: u32) -> Result<()> {
        let (parent, leaf) = find_dir(self, cwd, path)?;
        let dir = Dir::open(parent);
        let res = (|| {
            let sector = self.freemap.allocate(self, 1)?;
            // Until the record is written the sector holds nothing worth
            // keeping, so an early failure just returns it.
            let sector = scopeguard::guard(sector, |sector| {
                let _ = self.freemap.release(self, sector, 1);
            });
            inode::create(self, *sector, initial_size, false)?;
            let sector = ScopeGuard::into_inner(sector);

            if let Err(e) = dir.add(self, &leaf, sector) {
                let ino = inode::open(self, sector)?;
                inode::remove(&ino);
                inode::close(self, ino)?;
                return Err(e);
            }
            Ok(())
        })();
        dir.close(self)?;
        res
    }

    pub(crate) fn open_at(&self, cwd: u32, path: &str) -> Result<Desc> {
        let (parent, leaf) = find_dir(self, cwd, path)?;
        let dir = Dir::open(parent);
        let found = dir.lookup(self, &leaf);
        dir.close(self)?;

        let (entry, _) = found?.ok_or(FsError::PathNotFound)?;
        let ino = inode::open(self, entry.inode_sector)?;
        if ino.is_dir() {
            Ok(Desc::Dir(Dir::open(ino)))
        } else {
            Ok(Desc::File(crate::file::File::new(ino)))
        }
    }

    pub(crate) fn remove_at(&self, cwd: u32, path: &str) -> Result<()> {
        let (parent, leaf) = find_dir(self, cwd, path)?;
        let dir = Dir::open(parent);
        let res = (|| {
            // Unlinking a `.` or `..` slot would orphan everything under the
            // directory it names.
            if leaf.as_str() == "." || leaf.as_str() == ".." {
                return Err(FsError::InvalidArg);
            }
            let (entry, _) = dir.lookup(self, &leaf)?.ok_or(FsError::PathNotFound)?;
            let ino = inode::open(self, entry.inode_sector)?;
            if ino.is_dir() {
                let target = Dir::open(ino);
                let check = (|| {
                    if !target.is_empty(self)? {
                        return Err(FsError::DirNotEmpty);
                    }
                    if self.is_any_cwd(target.inumber()) {
                        return Err(FsError::DirBusy);
                    }
                    Ok(())
                })();
                target.close(self)?;
                check?;
            } else {
                inode::close(self, ino)?;
            }
            dir.remove(self, &leaf)
        })();
        dir.close(self)?;
        res
    }

    pub(crate) fn mkdir_at(&self, cwd: u32, path: &str) -> Result<()> {
        let (parent, leaf) = find_dir(self, cwd, path)?;
        let dir = Dir::open(parent);
        let res = (|| {
            if leaf.as_str() == "." {
                return Err(FsError::InvalidArg);
            }
            let sector = self.freemap.allocate(self, 1)?;
            let sector = scopeguard::guard(sector, |sector| {
                let _ = self.freemap.release(self, sector, 1);
            });
            dir::create(self, *sector, 0)?;
            let sector = ScopeGuard::into_inner(sector);

            if let Err(e) = dir.add(self, &leaf, sector) {
                let ino = inode::open(self, sector)?;
                inode::remove(&ino);
                inode::close(self, ino)?;
                return Err(e);
            }

            // Populate the new directory's `.` and `..` and point its inode
            // back at the parent.
            let child = Dir::open(inode::open(self, sector)?);
            let seed = (|| {
                child.add(self, ".", sector)?;
                child.add(self, "..", dir.inumber())?;
                inode::set_parent(self, dir.inumber(), sector)
            })();
            child.close(self)?;
            seed
        })();
        dir.close(self)?;
        res
    }

    pub(crate) fn chdir_at(&self, session: u64, cwd: u32, path: &str) -> Result<()> {
        let (parent, leaf) = find_dir(self, cwd, path)?;
        let dir = Dir::open(parent);
        let res = (|| {
            let (entry, _) = dir.lookup(self, &leaf)?.ok_or(FsError::PathNotFound)?;
            let ino = inode::open(self, entry.inode_sector)?;
            let target = if ino.is_dir() {
                Some(ino.inumber())
            } else {
                None
            };
            inode::close(self, ino)?;
            let target = target.ok_or(FsError::PathNotFound)?;
            self.cwds.lock().unwrap().insert(session, target);
            Ok(())
        })();
        dir.close(self)?;
        res
    }

    fn is_any_cwd(&self, sector: u32) -> bool {
        self.cwds.lock().unwrap().values().any(|&cwd| cwd == sector)
    }
}

impl Drop for FsCore {
    fn drop(&mut self) {
        // Cooperative teardown: persist what we can, then stop the workers.
        let _ = self.freemap.close(self);
        let _ = self.cache.flush();
        self.cache.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::fresh_fs;
    use super::*;
    use crate::device::MemDisk;
    use crate::file::Desc;

    #[test]
    fn format_reserves_bootstrap_sectors() {
        let fs = fresh_fs(4096);
        // Sector 0 (free-map) and sector 1 (root) are never allocatable, and
        // both carry live structures.
        let root = Dir::open_root(&fs).unwrap();
        assert_eq!(root.inumber(), ROOT_DIR_SECTOR);
        assert!(root.inode().is_dir());
        root.close(&fs).unwrap();
    }

    #[test]
    fn root_has_dot_and_dotdot() {
        let fs = fresh_fs(4096);
        let root = Dir::open_root(&fs).unwrap();
        let (dot, _) = root.lookup(&fs, ".").unwrap().unwrap();
        let (dotdot, _) = root.lookup(&fs, "..").unwrap().unwrap();
        assert_eq!(dot.inode_sector, ROOT_DIR_SECTOR);
        assert_eq!(dotdot.inode_sector, ROOT_DIR_SECTOR);
        root.close(&fs).unwrap();
    }

    #[test]
    fn create_open_and_reopen() {
        let fs = fresh_fs(4096);
        fs.create("/hello", 0).unwrap();

        match fs.open("/hello").unwrap() {
            Desc::File(file) => file.close(&fs).unwrap(),
            Desc::Dir(_) => panic!("regular file opened as directory"),
        }
    }

    #[test]
    fn create_duplicate_name_fails() {
        let fs = fresh_fs(4096);
        fs.create("/a", 0).unwrap();
        assert_eq!(fs.create("/a", 0), Err(FsError::NameExists));
    }

    #[test]
    fn create_in_missing_parent_fails() {
        let fs = fresh_fs(4096);
        assert_eq!(fs.create("/no/file", 0), Err(FsError::PathNotFound));
    }

    #[test]
    fn failed_create_releases_the_inode_sector() {
        let fs = fresh_fs(4096);
        fs.create("/a", 1000).unwrap();
        let before = fs.freemap.free_count();
        assert_eq!(fs.create("/a", 1000), Err(FsError::NameExists));
        assert_eq!(fs.freemap.free_count(), before);
    }

    #[test]
    fn remove_frees_all_sectors() {
        let fs = fresh_fs(4096);
        let before = fs.freemap.free_count();
        // Large enough to need the single-indirect sector.
        fs.create("/big", 20 * 512).unwrap();
        assert!(fs.freemap.free_count() < before);
        fs.remove("/big").unwrap();
        assert_eq!(fs.freemap.free_count(), before);
    }

    #[test]
    fn remove_of_open_file_is_deferred() {
        let fs = fresh_fs(4096);
        fs.create("/tmp", 0).unwrap();
        let desc = fs.open("/tmp").unwrap();
        let before = fs.freemap.free_count();

        fs.remove("/tmp").unwrap();
        // Still open: nothing reclaimed yet, and the path is already gone.
        assert_eq!(fs.freemap.free_count(), before);
        assert_eq!(fs.open("/tmp").err(), Some(FsError::PathNotFound));

        desc.close(&fs).unwrap();
        assert_eq!(fs.freemap.free_count(), before + 1);
    }

    #[test]
    fn mkdir_seeds_dot_entries() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();
        let desc = fs.open("/d").unwrap();
        let d = match desc {
            Desc::Dir(d) => d,
            Desc::File(_) => panic!("directory opened as file"),
        };
        let (dot, _) = d.lookup(&fs, ".").unwrap().unwrap();
        let (dotdot, _) = d.lookup(&fs, "..").unwrap().unwrap();
        assert_eq!(dot.inode_sector, d.inumber());
        assert_eq!(dotdot.inode_sector, ROOT_DIR_SECTOR);
        assert_eq!(d.inode().parent(), ROOT_DIR_SECTOR);
        d.close(&fs).unwrap();
    }

    #[test]
    fn remove_nonempty_dir_fails() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();
        fs.create("/d/f", 0).unwrap();
        assert_eq!(fs.remove("/d"), Err(FsError::DirNotEmpty));
        fs.remove("/d/f").unwrap();
        fs.remove("/d").unwrap();
    }

    #[test]
    fn removed_slot_is_reused() {
        let fs = fresh_fs(4096);
        fs.create("/a", 0).unwrap();
        fs.create("/b", 0).unwrap();
        fs.remove("/a").unwrap();
        fs.create("/c", 0).unwrap();

        let root = Dir::open_root(&fs).unwrap();
        let (entry_b, ofs_b) = root.lookup(&fs, "b").unwrap().unwrap();
        let (_, ofs_c) = root.lookup(&fs, "c").unwrap().unwrap();
        // "c" landed in the slot "a" vacated, before "b".
        assert!(ofs_c < ofs_b);
        assert_ne!(entry_b.inode_sector, 0);
        root.close(&fs).unwrap();
    }

    #[test]
    fn state_survives_remount() {
        let disk = Arc::new(MemDisk::new(4096));
        {
            let fs = FileSys::new(disk.clone(), true).unwrap();
            fs.create("/persist", 0).unwrap();
            match fs.open("/persist").unwrap() {
                Desc::File(mut f) => {
                    assert_eq!(f.write(&fs, b"data").unwrap(), 4);
                    f.close(&fs).unwrap();
                }
                _ => panic!(),
            }
            fs.done().unwrap();
        }

        let fs = FileSys::new(disk, false).unwrap();
        match fs.open("/persist").unwrap() {
            Desc::File(mut f) => {
                let mut buf = [0u8; 4];
                assert_eq!(f.read(&fs, &mut buf).unwrap(), 4);
                assert_eq!(&buf, b"data");
                f.close(&fs).unwrap();
            }
            _ => panic!(),
        }
    }
}
