//! Storage core of a small educational file system.
//!
//! Three layers, bottom up:
//!
//!   + Cache: every sector access goes through a fixed set of write-back
//!     slots with clock eviction ([`block_cache`]).
//!   + Free map: one bit per device sector, persisted as the contents of a
//!     distinguished file whose inode lives at sector 0.
//!   + Inodes: direct / indirect / doubly-indirect index trees with
//!     byte-addressable read and write, growth up to [`MAX_LENGTH`], and the
//!     directory metadata (`is_dir`, parent back-pointer, child count) the
//!     directory layer builds on.
//!
//! Path resolution, directory entry encoding, and file descriptors live
//! above this crate; the raw device below it is anything implementing
//! [`BlockDevice`] with infallible sector I/O (see [`Disk`]).
//!
//! A mounted file system runs a write-behind task that flushes dirty cache
//! slots on a fixed cadence; [`Filesys::unmount`] (or drop) stops it and
//! flushes once more.

use std::convert::Infallible;

pub use block_cache::{BlockCache, BlockDevice, CacheStats, SlotGuard};
pub use edufs_types::{
    FREE_MAP_SECTOR, INODE_MAGIC, MAX_LENGTH, NUM_DIRECT, NUM_INDIRECT, ROOT_DIR_SECTOR,
    SECTOR_SIZE, SectorNo,
};

pub use self::{
    disk::RamDisk,
    error::Error,
    fs::{Filesys, Options},
    inode::Inode,
};

pub mod disk;
mod error;
mod free_map;
mod fs;
mod inode;

/// Block devices this file system can mount: sector-sized, infallible, and
/// shareable with the write-behind task.
pub trait Disk: BlockDevice<SECTOR_SIZE, Error = Infallible> + Send + Sync + 'static {}

impl<T> Disk for T where T: BlockDevice<SECTOR_SIZE, Error = Infallible> + Send + Sync + 'static {}

pub(crate) type Cache<D> = BlockCache<D, SECTOR_SIZE>;
pub(crate) type Slot<'a, D> = SlotGuard<'a, D, SECTOR_SIZE>;

pub(crate) fn infallible<T>(res: Result<T, Infallible>) -> T {
    match res {
        Ok(v) => v,
    }
}

/// Pins `sector`'s slot and returns its contents.
pub(crate) fn slot<D: Disk>(cache: &Cache<D>, sector: SectorNo) -> Slot<'_, D> {
    infallible(cache.get(sector.as_index()))
}

/// Pins `sector`'s slot zero-filled, without reading the device.
pub(crate) fn slot_zeroed<D: Disk>(cache: &Cache<D>, sector: SectorNo) -> Slot<'_, D> {
    infallible(cache.get_zeroed(sector.as_index()))
}
