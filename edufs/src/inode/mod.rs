//! Inode handles.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! record holds everything durable (index tree, length, directory
//! metadata) and is only ever touched through the cache, so every opener
//! observes one copy. The in-memory handle carries just identity and
//! bookkeeping: which sector, whether the inode is condemned, and whether
//! writes are currently denied.
//!
//! Handles are deduplicated per sector in a table: opening the same sector
//! twice yields references to the same state, cloning a handle reopens it,
//! and dropping the last reference tears the entry down. If
//! [`Inode::remove`] was called by then, the sector chain and the record
//! sector itself go back to the free map.
//!
//! Why uniqueness matters: the `removed` mark must be visible to every
//! opener so teardown happens exactly once, at the last close.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use edufs_types::{InodeRecord, SectorNo};

use crate::{Disk, Error, fs::FsState, slot};

pub(crate) mod content;

pub(crate) struct InodeTable {
    handles: Mutex<HashMap<u32, Arc<HandleState>>>,
}

struct HandleState {
    sector: SectorNo,
    /// Condemned: free the sector chain at last close.
    removed: AtomicBool,
    /// Non-zero disables writes (executable-in-use protection).
    deny_write_cnt: AtomicU32,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }
}

/// An open reference to an inode.
///
/// Clone to reopen; drop to close. All clones share one handle per sector.
pub struct Inode<D: Disk> {
    fs: Arc<FsState<D>>,
    state: Arc<HandleState>,
}

pub(crate) fn open<D: Disk>(fs: &Arc<FsState<D>>, sector: SectorNo) -> Inode<D> {
    #[cfg(debug_assertions)]
    {
        let rec_guard = slot(&fs.cache, sector);
        assert!(
            rec_guard.data::<InodeRecord>().is_valid(),
            "no inode at sector {sector}"
        );
    }

    let mut handles = fs.itable.handles.lock().unwrap();
    let state = handles.entry(sector.value()).or_insert_with(|| {
        Arc::new(HandleState {
            sector,
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicU32::new(0),
        })
    });
    let state = Arc::clone(state);
    drop(handles);

    Inode {
        fs: Arc::clone(fs),
        state,
    }
}

impl<D: Disk> Inode<D> {
    /// The record sector, which doubles as the inode's identity.
    pub fn sector(&self) -> SectorNo {
        self.state.sector
    }

    /// Logical length in bytes.
    pub fn length(&self) -> usize {
        slot(&self.fs.cache, self.state.sector)
            .data::<InodeRecord>()
            .length()
    }

    pub fn is_dir(&self) -> bool {
        slot(&self.fs.cache, self.state.sector)
            .data::<InodeRecord>()
            .is_dir()
    }

    /// Number of directory entries below this inode.
    pub fn num_children(&self) -> u32 {
        slot(&self.fs.cache, self.state.sector)
            .data::<InodeRecord>()
            .num_files()
    }

    /// Sector of the parent directory's inode (self for the root).
    pub fn parent_sector(&self) -> SectorNo {
        slot(&self.fs.cache, self.state.sector)
            .data::<InodeRecord>()
            .parent()
    }

    /// Reads up to `buf.len()` bytes at `offset`; returns how many were
    /// read. 0 at or past end of file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        content::read_at(&self.fs.cache, self.state.sector, offset, buf)
    }

    /// Writes `buf` at `offset`, growing the inode as needed; any gap
    /// between the old length and `offset` reads back as zero.
    ///
    /// Returns the number of bytes written: all of them, or 0 when writes
    /// are denied or growth fails.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.state.deny_write_cnt.load(Ordering::Acquire) > 0 {
            return 0;
        }
        content::write_at(
            &self.fs.cache,
            &self.fs.free_map,
            self.state.sector,
            offset,
            buf,
        )
    }

    /// Shrinks the inode to `new_length`, returning the sectors past it to
    /// the free map.
    ///
    /// # Panics
    ///
    /// Panics if `new_length` exceeds the current length.
    pub fn truncate(&self, new_length: usize) {
        let mut rec_guard = slot(&self.fs.cache, self.state.sector);
        let mut fm = self.fs.free_map.lock();
        content::truncate_to(&self.fs.cache, &mut fm, &mut rec_guard, new_length);
    }

    /// Condemns the inode: the sector chain and the record sector are
    /// released when the last opener closes.
    pub fn remove(&self) {
        self.state.removed.store(true, Ordering::Release);
    }

    /// Disables writes through every handle to this inode.
    ///
    /// At most once per opener; bracket with [`allow_write`](Self::allow_write).
    pub fn deny_write(&self) {
        let cnt = self.state.deny_write_cnt.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!((cnt as usize) < Arc::strong_count(&self.state));
    }

    /// Re-enables writes previously denied through this opener.
    pub fn allow_write(&self) {
        let prev = self.state.deny_write_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "allow_write without a matching deny_write");
    }

    /// Registers `child` under this directory: rebinds the child's parent
    /// pointer and bumps the child count.
    pub fn add_child(&self, child: SectorNo) -> Result<(), Error> {
        assert_ne!(child, self.state.sector);
        if !self.is_dir() {
            return Err(Error::NotADirectory);
        }
        {
            let mut g = slot(&self.fs.cache, child);
            g.data_mut::<InodeRecord>().set_parent(self.state.sector);
        }
        let mut g = slot(&self.fs.cache, self.state.sector);
        let rec = g.data_mut::<InodeRecord>();
        rec.set_num_files(rec.num_files() + 1);
        Ok(())
    }

    /// Drops one child from this directory's count.
    pub fn remove_child(&self) -> Result<(), Error> {
        if !self.is_dir() {
            return Err(Error::NotADirectory);
        }
        let mut g = slot(&self.fs.cache, self.state.sector);
        let rec = g.data_mut::<InodeRecord>();
        let n = rec.num_files();
        assert!(n > 0, "remove_child on an empty directory");
        rec.set_num_files(n - 1);
        Ok(())
    }
}

impl<D: Disk> fmt::Debug for Inode<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("sector", &self.state.sector)
            .finish_non_exhaustive()
    }
}

impl<D: Disk> Clone for Inode<D> {
    /// Reopens the inode: another reference to the same handle.
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
            state: Arc::clone(&self.state),
        }
    }
}

impl<D: Disk> Drop for Inode<D> {
    fn drop(&mut self) {
        let mut handles = self.fs.itable.handles.lock().unwrap();
        // One reference held by the table plus ours; any more means other
        // openers remain.
        if Arc::strong_count(&self.state) > 2 {
            return;
        }
        handles.remove(&self.state.sector.value());
        drop(handles);

        if self.state.removed.load(Ordering::Acquire) {
            let sector = self.state.sector;
            let mut rec_guard = slot(&self.fs.cache, sector);
            let mut fm = self.fs.free_map.lock();
            content::truncate_to(&self.fs.cache, &mut fm, &mut rec_guard, 0);
            drop(rec_guard);
            fm.release_contig(&self.fs.cache, sector, 1);
        }
    }
}
