//! On-disk data types for the edufs file system.
//!
//! The disk layout:
//!
//! | sector no. | content                  | type                         |
//! |------------|--------------------------|------------------------------|
//! | 0          | free-map file inode      | [`InodeRecord`]              |
//! | 1          | root directory inode     | [`InodeRecord`]              |
//! | 2..        | dynamically allocated    | data, [`IndirectBlock`], ... |
//!
//! Every other sector is handed out by the free map: inode records, pointer
//! tables, and file data all come from the same pool. The free map's bitmap
//! is stored as the *contents* of the file rooted at sector 0, one bit per
//! device sector.

use core::fmt;

use dataview::Pod;

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors directly referenced by an inode record.
pub const NUM_DIRECT: usize = 120;

/// Number of sector pointers in one indirect table.
pub const NUM_INDIRECT: usize = SECTOR_SIZE / size_of::<u32>();

/// Hard ceiling on a file's logical length in bytes.
pub const MAX_LENGTH: usize = 8 * 1024 * 1024;

/// Maximum number of data sectors in a single file.
pub const MAX_SECTORS: usize = MAX_LENGTH / SECTOR_SIZE;

/// Sector holding the free-map file's inode record.
pub const FREE_MAP_SECTOR: SectorNo = SectorNo::new(0);

/// Sector holding the root directory's inode record.
pub const ROOT_DIR_SECTOR: SectorNo = SectorNo::new(1);

/// Sentinel identifying a valid inode record.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

const _: () = const {
    assert!(NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT >= MAX_SECTORS);
};

/// Returns the number of data sectors covering `len` bytes.
#[must_use]
pub const fn bytes_to_sectors(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE)
}

/// Device sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

/// On-disk inode record, exactly one sector wide.
///
/// The field order is load-bearing: existing images must parse. A raw `0`
/// in any pointer slot means "unallocated"; sector 0 holds the free-map
/// inode and never backs file data, so the sentinel is unambiguous.
#[derive(Pod)]
#[repr(C)]
pub struct InodeRecord {
    direct: [u32; NUM_DIRECT],
    indirect: u32,
    doubly_indirect: u32,
    parent: u32,
    num_files: u32,
    is_dir: u8,
    _pad: [u8; 3],
    length: i32,
    magic: u32,
    unused: [u8; 4],
}
const _: () = const { assert!(size_of::<InodeRecord>() == SECTOR_SIZE) };

impl InodeRecord {
    /// Stamps a zeroed record as a fresh inode of length 0.
    ///
    /// The parent pointer starts out self-referential; a directory layer
    /// rebinds it when the inode is linked somewhere.
    pub fn init(&mut self, sector: SectorNo, is_dir: bool) {
        self.parent = sector.value();
        self.num_files = 0;
        self.is_dir = u8::from(is_dir);
        self.length = 0;
        self.magic = INODE_MAGIC;
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[must_use]
    pub fn direct(&self, i: usize) -> Option<SectorNo> {
        decode(self.direct[i])
    }

    pub fn set_direct(&mut self, i: usize, n: Option<SectorNo>) {
        self.direct[i] = encode(n);
    }

    #[must_use]
    pub fn indirect(&self) -> Option<SectorNo> {
        decode(self.indirect)
    }

    pub fn set_indirect(&mut self, n: Option<SectorNo>) {
        self.indirect = encode(n);
    }

    #[must_use]
    pub fn doubly_indirect(&self) -> Option<SectorNo> {
        decode(self.doubly_indirect)
    }

    pub fn set_doubly_indirect(&mut self, n: Option<SectorNo>) {
        self.doubly_indirect = encode(n);
    }

    #[must_use]
    pub fn parent(&self) -> SectorNo {
        SectorNo::new(self.parent)
    }

    pub fn set_parent(&mut self, sector: SectorNo) {
        self.parent = sector.value();
    }

    #[must_use]
    pub fn num_files(&self) -> u32 {
        self.num_files
    }

    pub fn set_num_files(&mut self, n: u32) {
        self.num_files = n;
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    /// Logical length in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        usize::try_from(self.length).unwrap()
    }

    pub fn set_length(&mut self, len: usize) {
        assert!(len <= MAX_LENGTH);
        self.length = i32::try_from(len).unwrap();
    }

    /// Number of data sectors currently covered by `length`.
    #[must_use]
    pub fn sectors(&self) -> usize {
        bytes_to_sectors(self.length())
    }
}

/// One sector's worth of sector pointers, used for both the indirect table
/// and each level of the doubly-indirect tree.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; NUM_INDIRECT]);

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        decode(self.0[i])
    }

    pub fn set(&mut self, i: usize, n: Option<SectorNo>) {
        self.0[i] = encode(n);
    }

    /// Takes every pointer out of the table, leaving it empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Option<SectorNo>> + '_ {
        self.0.iter_mut().map(|n| decode(core::mem::take(n)))
    }
}
const _: () = const { assert!(size_of::<IndirectBlock>() == SECTOR_SIZE) };

fn decode(raw: u32) -> Option<SectorNo> {
    if raw == 0 { None } else { Some(SectorNo::new(raw)) }
}

fn encode(n: Option<SectorNo>) -> u32 {
    n.map_or(0, |n| {
        assert_ne!(n.value(), 0);
        n.value()
    })
}
