//! In-memory block device.

use std::{
    convert::Infallible,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{BlockDevice, SECTOR_SIZE};

/// A RAM-backed [`BlockDevice`] with infallible, serialized sector I/O.
///
/// Clones share the same storage, so a device can be handed to a file
/// system and inspected (or remounted) from the outside. Tracks how many
/// sector reads and writes actually reached the device; the cache layer is
/// supposed to absorb most of them.
#[derive(Clone)]
pub struct RamDisk {
    inner: Arc<Inner>,
}

struct Inner {
    sectors: Vec<Mutex<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    #[must_use]
    pub fn new(sector_count: usize) -> Self {
        let sectors = (0..sector_count)
            .map(|_| Mutex::new([0; SECTOR_SIZE]))
            .collect();
        Self {
            inner: Arc::new(Inner {
                sectors,
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Total sector reads issued to the device.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Total sector writes issued to the device.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice<SECTOR_SIZE> for RamDisk {
    type Error = Infallible;

    fn sector_count(&self) -> usize {
        self.inner.sectors.len()
    }

    fn read(&self, sector: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Infallible> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        data.copy_from_slice(&*self.inner.sectors[sector].lock().unwrap());
        Ok(())
    }

    fn write(&self, sector: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Infallible> {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.sectors[sector].lock().unwrap().copy_from_slice(data);
        Ok(())
    }
}
