//! System-call surface.
//!
//! A [`Session`] models one user process: a working directory and a table of
//! open descriptors numbered from 2 up (0 and 1 are the keyboard and the
//! console). The methods carry the conventional Unix-subset semantics: byte
//! counts or -1 from `read`/`write`, booleans from the path operations.
//! Entry from a session is serialized by a coarse gate on the facade; the
//! cache's flusher and read-ahead workers still run alongside.
//!
//! Process control (`Halt`, `Exit`, `Exec`, `Wait`) belongs to whatever
//! hosts the filesystem; those numbers exist here only so the surface is
//! complete.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::io::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::error::FsError;
use crate::file::Desc;
use crate::fs::FileSys;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// System-call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Syscall {
    Halt = 0,
    Exit,
    Exec,
    Wait,
    Create,
    Remove,
    Open,
    Filesize,
    Read,
    Write,
    Seek,
    Tell,
    Close,
    Chdir,
    Mkdir,
    Readdir,
    Isdir,
    Inumber,
}

impl TryFrom<usize> for Syscall {
    type Error = FsError;

    fn try_from(nr: usize) -> Result<Syscall, FsError> {
        use Syscall::*;
        Ok(match nr {
            0 => Halt,
            1 => Exit,
            2 => Exec,
            3 => Wait,
            4 => Create,
            5 => Remove,
            6 => Open,
            7 => Filesize,
            8 => Read,
            9 => Write,
            10 => Seek,
            11 => Tell,
            12 => Close,
            13 => Chdir,
            14 => Mkdir,
            15 => Readdir,
            16 => Isdir,
            17 => Inumber,
            _ => return Err(FsError::InvalidArg),
        })
    }
}

const STDIN_FD: i32 = 0;
const STDOUT_FD: i32 = 1;

struct FdTable {
    descs: BTreeMap<i32, Desc>,
    next: i32,
}

/// Per-process state: a working directory and a descriptor table.
pub struct Session {
    fs: FileSys,
    id: u64,
    fds: Mutex<FdTable>,
}

impl FileSys {
    /// Opens a session rooted at `/`.
    pub fn open_session(&self) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.cwds.lock().unwrap().insert(id, ROOT_DIR_SECTOR);
        Session {
            fs: self.clone(),
            id,
            fds: Mutex::new(FdTable {
                descs: BTreeMap::new(),
                next: 2,
            }),
        }
    }
}

impl Session {
    fn cwd(&self) -> u32 {
        self.fs.cwds.lock().unwrap()[&self.id]
    }

    pub fn create(&self, path: &str, initial_size: u32) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        self.fs.0.create_at(self.cwd(), path, initial_size).is_ok()
    }

    pub fn remove(&self, path: &str) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        self.fs.0.remove_at(self.cwd(), path).is_ok()
    }

    /// Opens `path` and returns a descriptor of 2 or more, or -1.
    pub fn open(&self, path: &str) -> i32 {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        match self.fs.0.open_at(self.cwd(), path) {
            Ok(desc) => {
                let mut fds = self.fds.lock().unwrap();
                let fd = fds.next;
                fds.next += 1;
                fds.descs.insert(fd, desc);
                fd
            }
            Err(_) => -1,
        }
    }

    pub fn filesize(&self, fd: i32) -> i32 {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        match self.fds.lock().unwrap().descs.get(&fd) {
            Some(desc) => desc.size() as i32,
            None => -1,
        }
    }

    /// Reads into `buf`, returning the byte count or -1. Descriptor 0 is the
    /// keyboard, which this library has none of, so it reports end-of-input.
    pub fn read(&self, fd: i32, buf: &mut [u8]) -> i32 {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        if fd == STDIN_FD {
            return 0;
        }
        let mut fds = self.fds.lock().unwrap();
        match fds.descs.get_mut(&fd) {
            Some(desc) => match desc.read(&self.fs, buf) {
                Ok(n) => n as i32,
                Err(_) => -1,
            },
            None => -1,
        }
    }

    /// Writes `buf`, returning the byte count or -1. Descriptor 1 is the
    /// console.
    pub fn write(&self, fd: i32, buf: &[u8]) -> i32 {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        if fd == STDOUT_FD {
            let mut out = std::io::stdout();
            return match out.write_all(buf) {
                Ok(()) => buf.len() as i32,
                Err(_) => -1,
            };
        }
        let mut fds = self.fds.lock().unwrap();
        match fds.descs.get_mut(&fd) {
            Some(desc) => match desc.write(&self.fs, buf) {
                Ok(n) => n as i32,
                Err(_) => -1,
            },
            None => -1,
        }
    }

    pub fn seek(&self, fd: i32, pos: u64) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        let mut fds = self.fds.lock().unwrap();
        match fds.descs.get_mut(&fd) {
            Some(desc) => desc.seek(pos).is_ok(),
            None => false,
        }
    }

    pub fn tell(&self, fd: i32) -> i32 {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        match self.fds.lock().unwrap().descs.get(&fd) {
            Some(desc) => match desc.tell() {
                Ok(pos) => pos as i32,
                Err(_) => -1,
            },
            None => -1,
        }
    }

    pub fn close(&self, fd: i32) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        let desc = self.fds.lock().unwrap().descs.remove(&fd);
        match desc {
            Some(desc) => desc.close(&self.fs).is_ok(),
            None => false,
        }
    }

    pub fn chdir(&self, path: &str) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        self.fs.0.chdir_at(self.id, self.cwd(), path).is_ok()
    }

    pub fn mkdir(&self, path: &str) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        self.fs.0.mkdir_at(self.cwd(), path).is_ok()
    }

    /// Fills `name` with the next entry of an open directory, NUL
    /// terminated. Returns false at end-of-directory or on a non-directory
    /// descriptor.
    pub fn readdir(&self, fd: i32, name: &mut [u8; NAME_MAX + 1]) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        let mut fds = self.fds.lock().unwrap();
        let desc = match fds.descs.get_mut(&fd) {
            Some(desc) => desc,
            None => return false,
        };
        match desc.readdir(&self.fs) {
            Ok(Some(next)) => {
                name.fill(0);
                name[..next.len()].copy_from_slice(next.as_bytes());
                true
            }
            Ok(None) | Err(_) => false,
        }
    }

    pub fn isdir(&self, fd: i32) -> bool {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        match self.fds.lock().unwrap().descs.get(&fd) {
            Some(desc) => desc.is_dir(),
            None => false,
        }
    }

    pub fn inumber(&self, fd: i32) -> i32 {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        match self.fds.lock().unwrap().descs.get(&fd) {
            Some(desc) => desc.inumber() as i32,
            None => -1,
        }
    }

    /// Access to a live descriptor for operations outside the integer
    /// surface, such as deny-write.
    pub fn with_desc<R>(&self, fd: i32, f: impl FnOnce(&mut Desc) -> R) -> Option<R> {
        let _gate = self.fs.syscall_gate.lock().unwrap();
        self.fds.lock().unwrap().descs.get_mut(&fd).map(f)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let descs: Vec<Desc> = {
            let mut fds = self.fds.lock().unwrap();
            std::mem::take(&mut fds.descs).into_iter().map(|(_, d)| d).collect()
        };
        for desc in descs {
            let _ = desc.close(&self.fs);
        }
        self.fs.cwds.lock().unwrap().remove(&self.id);
    }
}
