//! Buffer cache.
//!
//! The buffer cache is a fixed array of cache lines holding cached copies of
//! disk sector contents. Caching sectors in memory reduces the number of disk
//! transfers and also provides a synchronization point for sectors used by
//! multiple threads.
//!
//! Interface:
//! * To read a sector through the cache, call `read`.
//! * To overwrite a whole sector, call `write`; the line is marked dirty and
//!   written back later (on eviction, by the periodic flusher, or by `flush`).
//! * `write` expects a full sector from the caller; partial-sector updates are
//!   assembled one layer up, in the inode code, via bounce buffers.
//!
//! Each line carries one mutex that serves both as its lookup token and as the
//! "being transferred" marker, so readers of a hot line block each other for
//! the duration of the backing device I/O. `find_cacheline` and `choose_evict`
//! return with the line's guard held; dropping the guard releases the line.
//!
//! Every `read` also enqueues the next sector on a bounded read-ahead ring.
//! A worker thread drains the ring (most recent request first) and faults the
//! sector into the cache without copying it anywhere. A second worker flushes
//! all dirty lines every few seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use array_macro::array;
use arrayvec::ArrayVec;
use log::{debug, error};

use crate::device::BlockDevice;
use crate::error::Result;
use crate::param::{FLUSH_INTERVAL_MS, NBUF, READ_AHEAD_BUFFER_SIZE, SECTOR_SIZE};

struct LineState {
    /// Has data been read from disk?
    valid: bool,
    /// Does the line hold bytes newer than the disk's?
    dirty: bool,
    sector: u32,
    /// Logical tick of the most recent access, for LRU eviction.
    ticks: u64,
    dev: Option<Arc<dyn BlockDevice>>,
    data: [u8; SECTOR_SIZE],
}

struct CacheLine {
    state: Mutex<LineState>,
}

impl CacheLine {
    fn new() -> Self {
        Self {
            state: Mutex::new(LineState {
                valid: false,
                dirty: false,
                sector: 0,
                ticks: 0,
                dev: None,
                data: [0; SECTOR_SIZE],
            }),
        }
    }
}

struct ReadAheadReq {
    dev: Arc<dyn BlockDevice>,
    sector: u32,
}

struct ReadAheadState {
    queue: ArrayVec<ReadAheadReq, READ_AHEAD_BUFFER_SIZE>,
    stop: bool,
}

struct ReadAhead {
    state: Mutex<ReadAheadState>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct Shutdown {
    stop: Mutex<bool>,
    cvar: Condvar,
}

pub struct Bcache {
    lines: [CacheLine; NBUF],
    ticks: AtomicU64,
    /// Serializes the miss path. Without it, two threads missing on the same
    /// sector could each evict a line and install duplicates, breaking the
    /// one-line-per-sector invariant.
    install: Mutex<()>,
    read_ahead: ReadAhead,
    shutdown: Shutdown,
    started: spin::Once<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Bcache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: array![_ => CacheLine::new(); NBUF],
            ticks: AtomicU64::new(0),
            install: Mutex::new(()),
            read_ahead: ReadAhead {
                state: Mutex::new(ReadAheadState {
                    queue: ArrayVec::new(),
                    stop: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            },
            shutdown: Shutdown {
                stop: Mutex::new(false),
                cvar: Condvar::new(),
            },
            started: spin::Once::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the periodic flusher and the read-ahead consumer. Runs at most
    /// once per cache; `shutdown` joins both.
    pub fn start(self: &Arc<Self>) {
        self.started.call_once(|| {
            let cache = Arc::clone(self);
            let flusher = thread::Builder::new()
                .name("bcache-flusher".into())
                .spawn(move || cache.flusher_loop())
                .expect("bcache: spawn flusher");
            let cache = Arc::clone(self);
            let consumer = thread::Builder::new()
                .name("bcache-read-ahead".into())
                .spawn(move || cache.read_ahead_loop())
                .expect("bcache: spawn read-ahead");
            self.workers.lock().unwrap().extend([flusher, consumer]);
        });
    }

    /// Copies one sector of data into `buf`, faulting it in on a miss, then
    /// enqueues the following sector for read-ahead. `buf` must be exactly
    /// one sector long.
    pub fn read(&self, dev: &Arc<dyn BlockDevice>, sector: u32, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut line = match self.find_cacheline(dev, sector) {
            Some(line) => line,
            None => {
                let _guard = self.install.lock().unwrap();
                // Another thread may have installed the sector while we were
                // waiting for the install token.
                match self.find_cacheline(dev, sector) {
                    Some(line) => line,
                    None => {
                        let mut line = self.choose_evict()?;
                        line.dirty = false;
                        line.sector = sector;
                        line.dev = Some(Arc::clone(dev));
                        if let Err(e) = dev.read_sector(sector, &mut line.data) {
                            line.valid = false;
                            return Err(e);
                        }
                        line.valid = true;
                        line
                    }
                }
            }
        };
        buf.copy_from_slice(&line.data);
        line.ticks = self.bump();
        drop(line);
        // The consumer filters sectors past the end of the device.
        self.put_read_ahead(dev, sector + 1);
        Ok(())
    }

    /// Overwrites one cached sector with `buf` and marks the line dirty. On a
    /// miss the line is installed without touching the disk: the caller's
    /// contract is that `buf` is a complete sector.
    pub fn write(&self, dev: &Arc<dyn BlockDevice>, sector: u32, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut line = match self.find_cacheline(dev, sector) {
            Some(line) => line,
            None => {
                let _guard = self.install.lock().unwrap();
                match self.find_cacheline(dev, sector) {
                    Some(line) => line,
                    None => {
                        let mut line = self.choose_evict()?;
                        line.valid = true;
                        line.sector = sector;
                        line.dev = Some(Arc::clone(dev));
                        line
                    }
                }
            }
        };
        line.data.copy_from_slice(buf);
        line.ticks = self.bump();
        line.dirty = true;
        Ok(())
    }

    /// Writes every valid dirty line back to its device and clears the dirty
    /// flags. Idempotent.
    pub fn flush(&self) -> Result<()> {
        for line in self.lines.iter() {
            let mut st = line.state.lock().unwrap();
            if st.valid && st.dirty {
                if let Some(dev) = st.dev.clone() {
                    dev.write_sector(st.sector, &st.data)?;
                }
                st.dirty = false;
            }
        }
        Ok(())
    }

    /// Stops both workers and joins them. Further `read`/`write` calls still
    /// work; they just lose read-ahead and periodic flushing.
    pub fn shutdown(&self) {
        {
            let mut stop = self.shutdown.stop.lock().unwrap();
            *stop = true;
            self.shutdown.cvar.notify_all();
        }
        {
            let mut state = self.read_ahead.state.lock().unwrap();
            state.stop = true;
            self.read_ahead.not_empty.notify_all();
            self.read_ahead.not_full.notify_all();
        }
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn bump(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Scans the lines in index order for `(dev, sector)`. On a match the
    /// line's guard is returned still held; the caller releases it by
    /// dropping. Mismatched lines are released during the scan.
    fn find_cacheline(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
    ) -> Option<MutexGuard<'_, LineState>> {
        for line in self.lines.iter() {
            let st = line.state.lock().unwrap();
            if st.valid && st.sector == sector && st.dev.as_ref().map_or(false, |d| Arc::ptr_eq(d, dev))
            {
                return Some(st);
            }
        }
        None
    }

    /// Picks a line to reuse and returns it held. The first invalid line
    /// wins immediately; otherwise the least recently used line does, ties
    /// going to the lowest index. A dirty winner is written back before it is
    /// handed out. Lines are acquired in ascending index order and every
    /// non-winner is released as the scan moves on.
    fn choose_evict(&self) -> Result<MutexGuard<'_, LineState>> {
        let mut evict: Option<MutexGuard<'_, LineState>> = None;
        let mut earliest = self.ticks.load(Ordering::Relaxed) + 1;
        for line in self.lines.iter() {
            let st = line.state.lock().unwrap();
            if !st.valid {
                return Ok(st);
            }
            if st.ticks < earliest {
                earliest = st.ticks;
                evict = Some(st);
            }
        }
        // Every valid line was stamped at or below the current tick, so the
        // scan above cannot come back empty.
        let mut st = evict.expect("choose_evict: no line");
        if st.dirty {
            debug!("evicting dirty sector {}", st.sector);
            if let Some(dev) = st.dev.clone() {
                dev.write_sector(st.sector, &st.data)?;
            }
            st.dirty = false;
        }
        Ok(st)
    }

    /// Read-ahead producer. Blocks while the ring is full.
    fn put_read_ahead(&self, dev: &Arc<dyn BlockDevice>, sector: u32) {
        let mut state = self.read_ahead.state.lock().unwrap();
        while state.queue.is_full() && !state.stop {
            state = self.read_ahead.not_full.wait(state).unwrap();
        }
        if state.stop {
            return;
        }
        state.queue.push(ReadAheadReq {
            dev: Arc::clone(dev),
            sector,
        });
        self.read_ahead.not_empty.notify_one();
    }

    /// Read-ahead consumer loop: drains the ring one request at a time, most
    /// recent first, and faults each surviving sector into the cache.
    fn read_ahead_loop(&self) {
        loop {
            let mut state = self.read_ahead.state.lock().unwrap();
            while state.queue.is_empty() && !state.stop {
                state = self.read_ahead.not_empty.wait(state).unwrap();
            }
            if state.stop {
                return;
            }
            if let Some(req) = state.queue.pop() {
                if req.sector < req.dev.sector_count() {
                    if let Err(e) = self.fetch_resident(&req.dev, req.sector) {
                        debug!("read-ahead of sector {} failed: {}", req.sector, e);
                    }
                }
            }
            self.read_ahead.not_full.notify_one();
        }
    }

    /// The cache-resident half of `read`: installs the sector if absent and
    /// copies nothing to any caller.
    fn fetch_resident(&self, dev: &Arc<dyn BlockDevice>, sector: u32) -> Result<()> {
        match self.find_cacheline(dev, sector) {
            Some(line) => drop(line),
            None => {
                let _guard = self.install.lock().unwrap();
                if self.find_cacheline(dev, sector).is_some() {
                    return Ok(());
                }
                let mut line = self.choose_evict()?;
                line.dirty = false;
                line.sector = sector;
                line.dev = Some(Arc::clone(dev));
                match dev.read_sector(sector, &mut line.data) {
                    Ok(()) => line.valid = true,
                    Err(e) => {
                        line.valid = false;
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn flusher_loop(&self) {
        loop {
            let stop = self.shutdown.stop.lock().unwrap();
            let (stop, _) = self
                .shutdown
                .cvar
                .wait_timeout(stop, Duration::from_millis(FLUSH_INTERVAL_MS))
                .unwrap();
            if *stop {
                return;
            }
            drop(stop);
            if let Err(e) = self.flush() {
                error!("periodic cache flush failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use std::time::Instant;

    fn disk(sectors: u32) -> Arc<dyn BlockDevice> {
        Arc::new(MemDisk::new(sectors))
    }

    fn filled(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn write_is_deferred_until_flush() {
        let mem = Arc::new(MemDisk::new(16));
        let dev: Arc<dyn BlockDevice> = mem.clone();
        let cache = Bcache::new();
        cache.start();

        cache.write(&dev, 3, &filled(0xAB)).unwrap();
        // Write-back policy: the device still holds zeros.
        assert!(mem.snapshot()[3 * SECTOR_SIZE..4 * SECTOR_SIZE]
            .iter()
            .all(|&b| b == 0));

        cache.flush().unwrap();
        assert!(mem.snapshot()[3 * SECTOR_SIZE..4 * SECTOR_SIZE]
            .iter()
            .all(|&b| b == 0xAB));
        cache.shutdown();
    }

    #[test]
    fn read_after_write_round_trips() {
        let dev = disk(16);
        let cache = Bcache::new();
        cache.start();

        cache.write(&dev, 5, &filled(0x5A)).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(&dev, 5, &mut buf).unwrap();
        assert_eq!(buf, filled(0x5A));
        cache.shutdown();
    }

    #[test]
    fn flush_is_idempotent() {
        let mem = Arc::new(MemDisk::new(16));
        let dev: Arc<dyn BlockDevice> = mem.clone();
        let cache = Bcache::new();
        cache.start();

        for s in 0..8 {
            cache.write(&dev, s, &filled(s as u8)).unwrap();
        }
        cache.flush().unwrap();
        let first = mem.snapshot();
        cache.flush().unwrap();
        assert_eq!(first, mem.snapshot());
        cache.shutdown();
    }

    #[test]
    fn no_two_valid_lines_share_a_sector() {
        let dev = disk(NBUF as u32 * 2);
        let cache = Bcache::new();
        cache.start();

        // Hammer a few sectors from both the write and read paths.
        for round in 0..4 {
            for s in 0..8 {
                cache.write(&dev, s, &filled(round)).unwrap();
                let mut buf = [0u8; SECTOR_SIZE];
                cache.read(&dev, s, &mut buf).unwrap();
            }
        }

        let mut seen = std::collections::HashSet::new();
        for line in cache.lines.iter() {
            let st = line.state.lock().unwrap();
            if st.valid {
                assert!(seen.insert(st.sector), "sector {} cached twice", st.sector);
            }
        }
        cache.shutdown();
    }

    #[test]
    fn eviction_prefers_least_recently_used() {
        let mem = Arc::new(MemDisk::new(NBUF as u32 + 8));
        let dev: Arc<dyn BlockDevice> = mem.clone();
        let cache = Bcache::new();
        cache.start();

        // Fill every line, then refresh sector 0 so sector 1 is the oldest.
        for s in 0..NBUF as u32 {
            cache.write(&dev, s, &filled(s as u8)).unwrap();
        }
        cache.write(&dev, 0, &filled(0xF0)).unwrap();

        // Installing one more sector must push out sector 1, writing it back.
        cache.write(&dev, NBUF as u32, &filled(0xEE)).unwrap();
        assert!(mem.snapshot()[SECTOR_SIZE..2 * SECTOR_SIZE]
            .iter()
            .all(|&b| b == 1));
        assert!(cache.find_cacheline(&dev, 1).is_none());
        assert!(cache.find_cacheline(&dev, 0).is_some());
        cache.shutdown();
    }

    #[test]
    fn read_ahead_faults_in_next_sector() {
        let mem = Arc::new(MemDisk::new(16));
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0x77;
        mem.write_sector(9, &sector).unwrap();
        let dev: Arc<dyn BlockDevice> = mem.clone();

        let cache = Bcache::new();
        cache.start();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(&dev, 8, &mut buf).unwrap();

        // The consumer runs asynchronously; poll until sector 9 shows up.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(line) = cache.find_cacheline(&dev, 9) {
                assert_eq!(line.data[0], 0x77);
                break;
            }
            assert!(Instant::now() < deadline, "read-ahead never fetched sector 9");
            thread::sleep(Duration::from_millis(10));
        }
        cache.shutdown();
    }

    #[test]
    fn read_ahead_at_end_of_device_is_dropped() {
        let dev = disk(4);
        let cache = Bcache::new();
        cache.start();
        let mut buf = [0u8; SECTOR_SIZE];
        // Reading the last sector enqueues sector 4, which the consumer must
        // filter rather than touch the device with.
        cache.read(&dev, 3, &mut buf).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(cache.find_cacheline(&dev, 4).is_none());
        cache.shutdown();
    }

    #[test]
    fn shutdown_joins_workers() {
        let dev = disk(8);
        let cache = Bcache::new();
        cache.start();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(&dev, 0, &mut buf).unwrap();
        cache.shutdown();
        assert!(cache.workers.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_readers_and_writers_settle() {
        let mem = Arc::new(MemDisk::new(64));
        let dev: Arc<dyn BlockDevice> = mem.clone();
        let cache = Bcache::new();
        cache.start();

        let mut handles = Vec::new();
        for t in 0..4u8 {
            let cache = Arc::clone(&cache);
            let dev = Arc::clone(&dev);
            handles.push(thread::spawn(move || {
                for round in 0..16 {
                    let sector = (t as u32) * 8 + (round % 8);
                    cache.write(&dev, sector, &filled(t)).unwrap();
                    let mut buf = [0u8; SECTOR_SIZE];
                    cache.read(&dev, sector, &mut buf).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        cache.flush().unwrap();
        // Each thread owned its own sector range, so its byte must survive.
        let snap = mem.snapshot();
        for t in 0..4u8 {
            let start = (t as usize) * 8 * SECTOR_SIZE;
            assert!(snap[start..start + SECTOR_SIZE].iter().all(|&b| b == t));
        }
        cache.shutdown();
    }
}
