//! Mounting, formatting, and the write-behind task.

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use block_cache::{BlockCache, CacheStats};
use edufs_types::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SectorNo};

use crate::{
    Cache, Disk, Error, infallible,
    free_map::FreeMap,
    inode::{self, Inode, InodeTable, content},
};

/// Mount-time configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of buffer cache slots.
    pub cache_slots: usize,
    /// Cadence of the write-behind task.
    pub write_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_slots: 64,
            write_delay: Duration::from_secs(30),
        }
    }
}

pub(crate) struct FsState<D: Disk> {
    pub(crate) cache: Cache<D>,
    pub(crate) free_map: FreeMap,
    pub(crate) itable: InodeTable,
}

/// A mounted file system.
///
/// Unmounting (or dropping) stops the write-behind task and flushes the
/// cache; handles obtained from [`open`](Self::open) stay valid until they
/// are dropped, but writes made after the flush only reach the device
/// through eviction.
pub struct Filesys<D: Disk> {
    state: Arc<FsState<D>>,
    writeback: Option<Writeback>,
}

struct Writeback {
    stop: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl<D: Disk> Filesys<D> {
    /// Formats `device` with an empty file system and mounts it.
    ///
    /// Sector 0 is reserved for the free-map file's inode and sector 1 for
    /// the root directory's; both are created here, and the bitmap (sized
    /// to one bit per device sector) is written out through its file.
    ///
    /// # Panics
    ///
    /// Panics if the device is too small to hold the free map itself.
    pub fn format(device: D, options: &Options) -> Self {
        let cache = BlockCache::new(device, options.cache_slots);
        let free_map = FreeMap::new(cache.sector_count());
        {
            let mut fm = free_map.lock();
            fm.mark_reserved(FREE_MAP_SECTOR);
            fm.mark_reserved(ROOT_DIR_SECTOR);
        }

        // The free-map file's own allocations go through the still detached
        // map; `attach` persists the final bitmap once the file exists.
        let bitmap_bytes = cache.sector_count().div_ceil(8);
        content::create_at(&cache, &free_map, FREE_MAP_SECTOR, bitmap_bytes, false)
            .expect("free map creation failed");
        content::create_at(&cache, &free_map, ROOT_DIR_SECTOR, 0, true)
            .expect("root directory creation failed");
        free_map.lock().attach(&cache);

        Self::start(cache, free_map, options)
    }

    /// Mounts an already formatted device, reading the free map back from
    /// its file.
    pub fn mount(device: D, options: &Options) -> Self {
        let cache = BlockCache::new(device, options.cache_slots);
        let free_map = FreeMap::new(cache.sector_count());
        free_map.lock().load(&cache);
        Self::start(cache, free_map, options)
    }

    fn start(cache: Cache<D>, free_map: FreeMap, options: &Options) -> Self {
        let state = Arc::new(FsState {
            cache,
            free_map,
            itable: InodeTable::new(),
        });
        let writeback = Writeback::spawn(Arc::clone(&state), options.write_delay);
        Self {
            state,
            writeback: Some(writeback),
        }
    }

    /// Opens the inode at `sector`. Repeated opens of the same sector share
    /// one handle.
    pub fn open(&self, sector: SectorNo) -> Inode<D> {
        inode::open(&self.state, sector)
    }

    /// Opens the root directory.
    pub fn root(&self) -> Inode<D> {
        self.open(ROOT_DIR_SECTOR)
    }

    /// Creates an inode of `length` bytes at the caller-chosen `sector`.
    ///
    /// The sector must already be allocated (or reserved) in the free map.
    pub fn create_at(&self, sector: SectorNo, length: usize, is_dir: bool) -> Result<(), Error> {
        content::create_at(&self.state.cache, &self.state.free_map, sector, length, is_dir)
    }

    /// Allocates a sector, creates an inode of `length` bytes there, and
    /// opens it. The sector is released again if creation fails.
    pub fn create_inode(&self, length: usize, is_dir: bool) -> Result<Inode<D>, Error> {
        let sector = self.state.free_map.allocate_contig(&self.state.cache, 1)?;
        match self.create_at(sector, length, is_dir) {
            Ok(()) => Ok(self.open(sector)),
            Err(e) => {
                self.state
                    .free_map
                    .release_contig(&self.state.cache, sector, 1);
                Err(e)
            }
        }
    }

    /// Allocates one sector from the free map.
    pub fn allocate_sector(&self) -> Result<SectorNo, Error> {
        self.state.free_map.allocate_contig(&self.state.cache, 1)
    }

    /// Returns a sector to the free map.
    pub fn release_sector(&self, sector: SectorNo) {
        self.state
            .free_map
            .release_contig(&self.state.cache, sector, 1);
    }

    /// Number of free sectors.
    pub fn available_sectors(&self) -> usize {
        self.state.free_map.available()
    }

    /// Writes every dirty, unpinned cache slot to the device.
    pub fn flush(&self) {
        infallible(self.state.cache.flush());
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.cache.stats()
    }

    /// Test hook: flush, then drop all cache contents and statistics.
    pub fn reset_cache(&self) {
        infallible(self.state.cache.reset());
    }

    /// Stops the write-behind task and flushes the cache.
    pub fn unmount(self) {
        drop(self);
    }

    fn shutdown(&mut self) {
        if let Some(wb) = self.writeback.take() {
            let _ = wb.stop.send(());
            let _ = wb.thread.join();
        }
        infallible(self.state.cache.flush());
    }
}

impl<D: Disk> Drop for Filesys<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Writeback {
    fn spawn<D: Disk>(state: Arc<FsState<D>>, delay: Duration) -> Self {
        let (stop, ticks) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("edufs-writeback".into())
            .spawn(move || {
                loop {
                    match ticks.recv_timeout(delay) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            infallible(state.cache.flush());
                        }
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn the write-behind task");
        Self { stop, thread }
    }
}
