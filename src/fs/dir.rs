//! Directories.
//!
//! A directory is an inode whose payload is a packed array of fixed-size
//! entries. Entries are never compacted: `remove` clears the in-use flag in
//! place and a later `add` reuses the first free slot it finds, appending at
//! end-of-file only when none is free. The first two slots of every directory
//! are `.` and `..`, so iteration starts past them.
//!
//! Path resolution lives here too: `find_dir` walks a path from the root or
//! the caller's working directory and reports the directory that contains
//! the final component, together with that component's name. A failed lookup
//! on the final component is not an error at this layer; callers use it to
//! tell "parent missing" apart from "leaf missing".

use core::mem;
use std::sync::Arc;

use arrayvec::ArrayString;
use itertools::Itertools;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, Result};
use crate::fs::inode::{self, Inode};
use crate::fs::FsCore;
use crate::param::{NAME_MAX, PATH_MAX, ROOT_DIR_SECTOR};

/// A single file name component, at most `NAME_MAX` bytes.
pub type FileName = ArrayString<NAME_MAX>;

pub(crate) const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// A single on-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    /// Home sector of the entry's inode.
    pub inode_sector: u32,
    /// Null-terminated file name.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const_assert!(DIRENT_SIZE == 20);

impl Dirent {
    /// Fill in name. If it is shorter than `NAME_MAX`, a NUL terminator is
    /// appended.
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
        if bytes.len() < self.name.len() {
            self.name[bytes.len()] = 0;
        }
    }

    /// The stored name, up to the first NUL.
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&ch| ch == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// An open directory: the backing inode plus the iteration cursor used by
/// `readdir`.
pub struct Dir {
    ino: Arc<Inode>,
    pos: u64,
}

/// Creates a directory inode at `sector` with room for `entry_cnt` entries.
pub(crate) fn create(fs: &FsCore, sector: u32, entry_cnt: usize) -> Result<()> {
    inode::create(fs, sector, (entry_cnt * DIRENT_SIZE) as u32, true)
}

impl Dir {
    /// Wraps an inode handle, taking ownership of the reference. The cursor
    /// starts past the `.` and `..` slots.
    pub(crate) fn open(ino: Arc<Inode>) -> Dir {
        Dir {
            ino,
            pos: (2 * DIRENT_SIZE) as u64,
        }
    }

    pub(crate) fn open_root(fs: &FsCore) -> Result<Dir> {
        Ok(Dir::open(inode::open(fs, ROOT_DIR_SECTOR)?))
    }

    /// Another reference to the backing inode.
    pub(crate) fn reopen_inode(&self) -> Arc<Inode> {
        self.ino.reopen()
    }

    pub fn inumber(&self) -> u32 {
        self.ino.inumber()
    }

    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.ino
    }

    /// Releases the backing inode reference.
    pub fn close(self, fs: &FsCore) -> Result<()> {
        inode::close(fs, self.ino)
    }

    /// Linear scan for the first in-use entry named `name`. Returns the
    /// entry and its byte offset.
    pub(crate) fn lookup(&self, fs: &FsCore, name: &str) -> Result<Option<(Dirent, u64)>> {
        let mut ofs = 0;
        loop {
            let mut entry = Dirent::default();
            if self.ino.read_at(fs, entry.as_bytes_mut(), ofs)? != DIRENT_SIZE {
                return Ok(None);
            }
            if entry.in_use != 0 && entry.name() == name {
                return Ok(Some((entry, ofs)));
            }
            ofs += DIRENT_SIZE as u64;
        }
    }

    /// Adds an entry for `name` referring to the inode at `inode_sector`,
    /// reusing the first free slot or appending at end-of-file.
    pub(crate) fn add(&self, fs: &FsCore, name: &str, inode_sector: u32) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArg);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        if self.lookup(fs, name)?.is_some() {
            return Err(FsError::NameExists);
        }

        // A short read can only mean end-of-file here, which doubles as the
        // append position.
        let mut ofs = 0;
        loop {
            let mut entry = Dirent::default();
            if self.ino.read_at(fs, entry.as_bytes_mut(), ofs)? != DIRENT_SIZE {
                break;
            }
            if entry.in_use == 0 {
                break;
            }
            ofs += DIRENT_SIZE as u64;
        }

        let mut entry = Dirent::default();
        entry.in_use = 1;
        entry.set_name(name);
        entry.inode_sector = inode_sector;
        if self.ino.write_at(fs, entry.as_bytes(), ofs)? != DIRENT_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Removes the entry for `name`: clears its in-use flag in place and
    /// marks the referenced inode for deletion at its last close.
    pub(crate) fn remove(&self, fs: &FsCore, name: &str) -> Result<()> {
        let (mut entry, ofs) = self.lookup(fs, name)?.ok_or(FsError::PathNotFound)?;
        let ino = inode::open(fs, entry.inode_sector)?;

        entry.in_use = 0;
        let written = self.ino.write_at(fs, entry.as_bytes(), ofs);
        match written {
            Ok(n) if n == DIRENT_SIZE => {
                inode::remove(&ino);
                inode::close(fs, ino)
            }
            Ok(_) => {
                inode::close(fs, ino)?;
                Err(FsError::Io)
            }
            Err(e) => {
                inode::close(fs, ino)?;
                Err(e)
            }
        }
    }

    /// Emits the next in-use entry name past the cursor, skipping free
    /// slots. Returns `None` at end-of-file.
    pub fn readdir(&mut self, fs: &FsCore) -> Result<Option<FileName>> {
        loop {
            let mut entry = Dirent::default();
            if self.ino.read_at(fs, entry.as_bytes_mut(), self.pos)? != DIRENT_SIZE {
                return Ok(None);
            }
            self.pos += DIRENT_SIZE as u64;
            if entry.in_use != 0 {
                return Ok(Some(FileName::from(entry.name()).unwrap_or_default()));
            }
        }
    }

    /// Whether the directory holds no entries besides `.` and `..`.
    pub(crate) fn is_empty(&self, fs: &FsCore) -> Result<bool> {
        let mut ofs = 0;
        loop {
            let mut entry = Dirent::default();
            if self.ino.read_at(fs, entry.as_bytes_mut(), ofs)? != DIRENT_SIZE {
                return Ok(true);
            }
            ofs += DIRENT_SIZE as u64;
            if entry.in_use != 0 && entry.name() != "." && entry.name() != ".." {
                return Ok(false);
            }
        }
    }

    /// Opens the containing directory's inode.
    pub(crate) fn parent(&self, fs: &FsCore) -> Result<Arc<Inode>> {
        inode::open(fs, self.ino.parent())
    }
}

/// Resolves `raw` into the directory that contains its final component plus
/// that component's name. Walking starts at the root for absolute paths and
/// at the inode at `cwd` otherwise. A path ending in `/` names the directory
/// itself, so the leaf comes back as `.`. A lookup failure on the final
/// component still succeeds here; a failure earlier in the walk does not.
pub(crate) fn find_dir(fs: &FsCore, cwd: u32, raw: &str) -> Result<(Arc<Inode>, FileName)> {
    if raw.is_empty() {
        return Err(FsError::InvalidArg);
    }
    if raw.len() > PATH_MAX {
        return Err(FsError::NameTooLong);
    }

    // Collapse runs of `/` so the walk sees the canonical spelling.
    let path: String = raw
        .chars()
        .dedup_by(|a, b| *a == '/' && *b == '/')
        .collect();

    let start = if path.starts_with('/') {
        Dir::open_root(fs)?
    } else {
        Dir::open(inode::open(fs, cwd)?)
    };
    let mut parent = start.reopen_inode();
    let mut dir = Some(start);
    let mut leaf = FileName::new();

    for token in path.split('/').filter(|t| !t.is_empty()) {
        // A dead end from the previous component means the intended parent
        // does not exist.
        let cur = match dir.take() {
            Some(cur) => cur,
            None => {
                inode::close(fs, parent)?;
                return Err(FsError::PathNotFound);
            }
        };
        if token.len() > NAME_MAX {
            cur.close(fs)?;
            inode::close(fs, parent)?;
            return Err(FsError::NameTooLong);
        }

        inode::close(fs, parent)?;
        parent = cur.reopen_inode();
        leaf = FileName::from(token).map_err(|_| FsError::NameTooLong)?;

        match cur.lookup(fs, token)? {
            Some((entry, _)) => {
                let next = inode::open(fs, entry.inode_sector)?;
                cur.close(fs)?;
                if next.is_dir() {
                    dir = Some(Dir::open(next));
                } else {
                    inode::close(fs, next)?;
                    dir = None;
                }
            }
            None => {
                cur.close(fs)?;
                dir = None;
            }
        }
    }

    if let Some(dir) = dir {
        dir.close(fs)?;
    }
    if leaf.is_empty() || path.ends_with('/') {
        leaf.clear();
        leaf.push_str(".");
    }
    Ok((parent, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::fresh_fs;
    use crate::param::ROOT_DIR_SECTOR;

    #[test]
    fn add_lookup_remove() {
        let fs = fresh_fs(4096);
        fs.create("/alpha", 0).unwrap();

        let root = Dir::open_root(&fs).unwrap();
        let (entry, _) = root.lookup(&fs, "alpha").unwrap().unwrap();
        assert_eq!(entry.name(), "alpha");
        assert!(root.lookup(&fs, "beta").unwrap().is_none());

        root.remove(&fs, "alpha").unwrap();
        assert!(root.lookup(&fs, "alpha").unwrap().is_none());
        root.close(&fs).unwrap();
    }

    #[test]
    fn add_rejects_bad_names() {
        let fs = fresh_fs(4096);
        let root = Dir::open_root(&fs).unwrap();
        assert_eq!(root.add(&fs, "", 9), Err(FsError::InvalidArg));
        assert_eq!(
            root.add(&fs, "fifteen-chars-x", 9),
            Err(FsError::NameTooLong)
        );
        // Exactly NAME_MAX bytes is fine.
        root.add(&fs, "fourteen-chars", ROOT_DIR_SECTOR).unwrap();
        assert_eq!(
            root.add(&fs, "fourteen-chars", 9),
            Err(FsError::NameExists)
        );
        root.close(&fs).unwrap();
    }

    #[test]
    fn readdir_skips_dot_entries_and_free_slots() {
        let fs = fresh_fs(4096);
        fs.create("/a", 0).unwrap();
        fs.create("/b", 0).unwrap();
        fs.create("/c", 0).unwrap();
        fs.remove("/b").unwrap();

        let mut root = Dir::open_root(&fs).unwrap();
        let mut names = Vec::new();
        while let Some(name) = root.readdir(&fs).unwrap() {
            names.push(name.to_string());
        }
        assert_eq!(names, ["a", "c"]);
        root.close(&fs).unwrap();
    }

    #[test]
    fn fresh_directory_is_empty() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();
        let desc = fs.open("/d").unwrap();
        match desc {
            crate::file::Desc::Dir(d) => {
                assert!(d.is_empty(&fs).unwrap());
                d.close(&fs).unwrap();
            }
            _ => panic!("expected a directory"),
        }
    }

    #[test]
    fn find_dir_splits_parent_and_leaf() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();
        fs.mkdir("/d/e").unwrap();

        let (parent, leaf) = find_dir(&fs, ROOT_DIR_SECTOR, "/d/e").unwrap();
        let d = fs.open("/d").unwrap();
        assert_eq!(parent.inumber(), d.inumber());
        assert_eq!(leaf.as_str(), "e");
        d.close(&fs).unwrap();
        inode::close(&fs, parent).unwrap();

        // The leaf may be missing; the parent still comes back.
        let (parent, leaf) = find_dir(&fs, ROOT_DIR_SECTOR, "/d/nothing").unwrap();
        assert_eq!(leaf.as_str(), "nothing");
        inode::close(&fs, parent).unwrap();

        // A missing component earlier in the walk is an error.
        assert_eq!(
            find_dir(&fs, ROOT_DIR_SECTOR, "/nothing/e").unwrap_err(),
            FsError::PathNotFound
        );
    }

    #[test]
    fn find_dir_ignores_redundant_slashes() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();
        fs.mkdir("/d/e").unwrap();

        let (p1, l1) = find_dir(&fs, ROOT_DIR_SECTOR, "/d/e").unwrap();
        let (p2, l2) = find_dir(&fs, ROOT_DIR_SECTOR, "//d///e").unwrap();
        assert_eq!(p1.inumber(), p2.inumber());
        assert_eq!(l1, l2);
        inode::close(&fs, p1).unwrap();
        inode::close(&fs, p2).unwrap();
    }

    #[test]
    fn find_dir_trailing_slash_names_dot() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();

        let (parent, leaf) = find_dir(&fs, ROOT_DIR_SECTOR, "/").unwrap();
        assert_eq!(parent.inumber(), ROOT_DIR_SECTOR);
        assert_eq!(leaf.as_str(), ".");
        inode::close(&fs, parent).unwrap();

        let (parent, leaf) = find_dir(&fs, ROOT_DIR_SECTOR, "/d/").unwrap();
        assert_eq!(leaf.as_str(), ".");
        inode::close(&fs, parent).unwrap();
    }

    #[test]
    fn find_dir_relative_paths_start_at_cwd() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();
        fs.mkdir("/d/e").unwrap();
        let d = fs.open("/d").unwrap();
        let d_sector = d.inumber();
        d.close(&fs).unwrap();

        let (parent, leaf) = find_dir(&fs, d_sector, "e").unwrap();
        assert_eq!(parent.inumber(), d_sector);
        assert_eq!(leaf.as_str(), "e");
        inode::close(&fs, parent).unwrap();

        // `..` is an ordinary entry, so walking up works without special
        // cases.
        let (parent, leaf) = find_dir(&fs, d_sector, "../d/e").unwrap();
        assert_eq!(parent.inumber(), d_sector);
        assert_eq!(leaf.as_str(), "e");
        inode::close(&fs, parent).unwrap();
    }

    #[test]
    fn parent_points_at_the_containing_directory() {
        let fs = fresh_fs(4096);
        fs.mkdir("/outer").unwrap();
        fs.mkdir("/outer/inner").unwrap();

        match fs.open("/outer/inner").unwrap() {
            crate::file::Desc::Dir(inner) => {
                let outer = fs.open("/outer").unwrap();
                let up = inner.parent(&fs).unwrap();
                assert_eq!(up.inumber(), outer.inumber());
                inode::close(&fs, up).unwrap();
                outer.close(&fs).unwrap();
                inner.close(&fs).unwrap();
            }
            _ => panic!("expected a directory"),
        }

        // The root is its own parent.
        let root = Dir::open_root(&fs).unwrap();
        let up = root.parent(&fs).unwrap();
        assert_eq!(up.inumber(), ROOT_DIR_SECTOR);
        inode::close(&fs, up).unwrap();
        root.close(&fs).unwrap();
    }

    #[test]
    fn find_dir_rejects_oversized_input() {
        let fs = fresh_fs(4096);
        assert_eq!(
            find_dir(&fs, ROOT_DIR_SECTOR, "").unwrap_err(),
            FsError::InvalidArg
        );
        let long = "x".repeat(crate::param::PATH_MAX + 1);
        assert_eq!(
            find_dir(&fs, ROOT_DIR_SECTOR, &long).unwrap_err(),
            FsError::NameTooLong
        );
        assert_eq!(
            find_dir(&fs, ROOT_DIR_SECTOR, "/also-too-long-name").unwrap_err(),
            FsError::NameTooLong
        );
    }

    #[test]
    fn walking_through_a_file_fails() {
        let fs = fresh_fs(4096);
        fs.create("/plain", 0).unwrap();
        assert_eq!(
            find_dir(&fs, ROOT_DIR_SECTOR, "/plain/child").unwrap_err(),
            FsError::PathNotFound
        );
    }

    #[test]
    fn open_handles_balance_across_resolution() {
        let fs = fresh_fs(4096);
        fs.mkdir("/d").unwrap();

        // After closing everything find_dir handed out, a removal of /d must
        // reclaim it immediately, proving no stray references were left.
        let (parent, _) = find_dir(&fs, ROOT_DIR_SECTOR, "/d/x").unwrap();
        inode::close(&fs, parent).unwrap();
        let before = fs.freemap.free_count();
        fs.remove("/d").unwrap();
        assert!(fs.freemap.free_count() > before);
    }
}
