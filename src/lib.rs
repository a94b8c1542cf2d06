//! chalkfs: a teaching-grade on-disk filesystem.
//!
//! The crate sits atop a fixed-size block device exposing sector-granular
//! random I/O and builds three subsystems on it:
//!
//! * a sector buffer cache with LRU eviction, write-back, periodic flushing,
//!   and asynchronous read-ahead ([`bio`]);
//! * an inode layer giving growable files through direct, single-indirect,
//!   and double-indirect block pointers ([`fs::inode`]);
//! * a hierarchical directory layer with name resolution over absolute and
//!   relative paths ([`fs::dir`]).
//!
//! [`fs::FileSys`] ties them together behind `create`/`open`/`remove`/
//! `mkdir`, and [`syscall::Session`] puts the conventional Unix-subset
//! integer surface on top, one session per simulated process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use chalkfs::device::MemDisk;
//! use chalkfs::fs::FileSys;
//!
//! # fn main() -> Result<(), chalkfs::FsError> {
//! let fs = FileSys::new(Arc::new(MemDisk::new(8192)), true)?;
//! fs.create("/notes", 0)?;
//! let mut desc = fs.open("/notes")?;
//! desc.write(&fs, b"hello")?;
//! desc.close(&fs)?;
//! fs.done()?;
//! # Ok(())
//! # }
//! ```

pub mod bio;
pub mod device;
pub mod error;
pub mod file;
pub mod fs;
pub mod param;
pub mod syscall;

pub use error::{FsError, Result};
pub use file::{Desc, File};
pub use fs::{FileSys, FsCore};
pub use syscall::{Session, Syscall};
