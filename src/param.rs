/// Size of one disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the disk sector cache, in cache lines.
pub const NBUF: usize = 64;

/// Capacity of the read-ahead request ring.
pub const READ_AHEAD_BUFFER_SIZE: usize = 64;

/// Interval between periodic cache flushes.
pub const FLUSH_INTERVAL_MS: u64 = 5000;

/// Direct data sectors recorded in an inode.
pub const NDIRECT: usize = 10;

/// Sector ids held by one indirection sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest file, in sectors: direct + single-indirect + double-indirect.
pub const MAXFILE_SECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Largest file, in bytes.
pub const MAXFILE_BYTES: u64 = (MAXFILE_SECTORS * SECTOR_SIZE) as u64;

/// Maximum length of a single file name component.
pub const NAME_MAX: usize = 14;

/// Maximum length of a path argument.
pub const PATH_MAX: usize = 256;

/// Sector holding the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Number of entries the root directory is formatted with.
pub const ROOT_DIR_ENTRIES: usize = 100;
