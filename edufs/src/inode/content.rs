//! Inode content.
//!
//! The data associated with an inode is addressed through three ranges of
//! its on-disk record: the first [`NUM_DIRECT`] data sectors sit in the
//! record itself, the next [`NUM_INDIRECT`] behind one indirect table, and
//! the rest behind a doubly-indirect table of up to [`NUM_INDIRECT`]
//! second-level tables. Pointer tables are ordinary sectors fetched through
//! the cache, just like the data they point at.
//!
//! Growth is all-or-nothing: the whole multi-step allocation runs on one
//! free-map guard, the exact sector cost (new data sectors plus new pointer
//! tables) is checked up front, and nothing is wired into the record until
//! every sector has been claimed.

use arrayvec::ArrayVec;
use edufs_types::{
    InodeRecord, IndirectBlock, MAX_LENGTH, NUM_DIRECT, NUM_INDIRECT, SECTOR_SIZE, SectorNo,
    bytes_to_sectors,
};

use crate::{
    Cache, Disk, Error, Slot,
    free_map::{FreeMap, FreeMapInner},
    slot, slot_zeroed,
};

/// First logical sector index served by the doubly-indirect tree.
const DOUBLY_BASE: usize = NUM_DIRECT + NUM_INDIRECT;

/// Number of second-level tables needed to cover `sectors` data sectors.
fn second_level_tables(sectors: usize) -> usize {
    sectors.saturating_sub(DOUBLY_BASE).div_ceil(NUM_INDIRECT)
}

/// Physical sector backing logical sector `idx` of the inode.
///
/// `idx` must be covered by the record's current length.
fn leaf_sector<D: Disk>(cache: &Cache<D>, rec: &InodeRecord, idx: usize) -> SectorNo {
    if idx < NUM_DIRECT {
        return rec.direct(idx).unwrap();
    }
    let i = idx - NUM_DIRECT;
    if i < NUM_INDIRECT {
        let tg = slot(cache, rec.indirect().unwrap());
        return tg.data::<IndirectBlock>().get(i).unwrap();
    }
    let i = i - NUM_INDIRECT;
    let second = {
        let dg = slot(cache, rec.doubly_indirect().unwrap());
        dg.data::<IndirectBlock>().get(i / NUM_INDIRECT).unwrap()
    };
    let tg = slot(cache, second);
    tg.data::<IndirectBlock>().get(i % NUM_INDIRECT).unwrap()
}

/// Writes a fresh inode record to `sector` and grows it to `length`.
///
/// The new inode is its own parent until a directory layer rebinds it. On
/// [`Error::OutOfSpace`] the record is left behind at length 0 and the
/// caller decides whether to release `sector`.
pub(crate) fn create_at<D: Disk>(
    cache: &Cache<D>,
    free_map: &FreeMap,
    sector: SectorNo,
    length: usize,
    is_dir: bool,
) -> Result<(), Error> {
    let mut rec_guard = slot_zeroed(cache, sector);
    rec_guard.data_mut::<InodeRecord>().init(sector, is_dir);
    let mut fm = free_map.lock();
    extend_to(cache, &mut fm, &mut rec_guard, length)
}

/// Reads up to `buf.len()` bytes starting at byte `offset`, returning how
/// many were read. Reads at or past the current length return 0.
pub(crate) fn read_at<D: Disk>(
    cache: &Cache<D>,
    sector: SectorNo,
    offset: usize,
    buf: &mut [u8],
) -> usize {
    let rec_guard = slot(cache, sector);
    let rec = rec_guard.data::<InodeRecord>();
    let length = rec.length();
    if offset >= length {
        return 0;
    }
    let n = usize::min(buf.len(), length - offset);

    let mut tot = 0;
    while tot < n {
        let off = offset + tot;
        let leaf = leaf_sector(cache, rec, off / SECTOR_SIZE);
        let m = usize::min(n - tot, SECTOR_SIZE - off % SECTOR_SIZE);
        let data = slot(cache, leaf);
        buf[tot..tot + m].copy_from_slice(&data.bytes()[off % SECTOR_SIZE..][..m]);
        tot += m;
    }
    n
}

/// Writes `buf` at byte `offset`, growing the inode first if the write
/// extends past the current length. Returns the number of bytes written:
/// all of them, or 0 if growth failed.
pub(crate) fn write_at<D: Disk>(
    cache: &Cache<D>,
    free_map: &FreeMap,
    sector: SectorNo,
    offset: usize,
    buf: &[u8],
) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let Some(end) = offset.checked_add(buf.len()) else {
        return 0;
    };

    let mut rec_guard = slot(cache, sector);
    if end > rec_guard.data::<InodeRecord>().length() {
        let mut fm = free_map.lock();
        if extend_to(cache, &mut fm, &mut rec_guard, end).is_err() {
            return 0;
        }
    }
    copy_in(cache, &rec_guard, offset, buf);
    buf.len()
}

/// Writes `buf` at `offset` without ever growing the inode; bytes past the
/// current length are dropped. This is the persistence path for the free
/// map file, which must not re-enter the allocator.
pub(crate) fn write_within<D: Disk>(
    cache: &Cache<D>,
    sector: SectorNo,
    offset: usize,
    buf: &[u8],
) -> usize {
    let rec_guard = slot(cache, sector);
    let length = rec_guard.data::<InodeRecord>().length();
    if offset >= length {
        return 0;
    }
    let n = usize::min(buf.len(), length - offset);
    copy_in(cache, &rec_guard, offset, &buf[..n]);
    n
}

fn copy_in<D: Disk>(cache: &Cache<D>, rec_guard: &Slot<'_, D>, offset: usize, buf: &[u8]) {
    let rec = rec_guard.data::<InodeRecord>();
    let n = buf.len();
    let mut tot = 0;
    while tot < n {
        let off = offset + tot;
        let leaf = leaf_sector(cache, rec, off / SECTOR_SIZE);
        let m = usize::min(n - tot, SECTOR_SIZE - off % SECTOR_SIZE);
        let mut data = slot(cache, leaf);
        data.bytes_mut()[off % SECTOR_SIZE..][..m].copy_from_slice(&buf[tot..tot + m]);
        tot += m;
    }
}

#[derive(Default)]
struct GrowPlan {
    indirect: Option<SectorNo>,
    doubly: Option<SectorNo>,
    seconds: Vec<SectorNo>,
    leaves: Vec<SectorNo>,
}

/// Grows the inode to `new_length`, allocating and zero-filling data
/// sectors and whatever pointer tables the new range needs.
///
/// Runs entirely on the caller's free-map guard, so concurrent growers
/// cannot over-commit. Fails without side effects when the device lacks
/// the exact number of sectors required.
pub(crate) fn extend_to<D: Disk>(
    cache: &Cache<D>,
    fm: &mut FreeMapInner,
    rec_guard: &mut Slot<'_, D>,
    new_length: usize,
) -> Result<(), Error> {
    let old_length = rec_guard.data::<InodeRecord>().length();
    assert!(new_length >= old_length);
    if new_length > MAX_LENGTH {
        return Err(Error::OutOfSpace);
    }
    if new_length == old_length {
        return Ok(());
    }

    // Bytes between the old length and the end of its final sector must
    // read as zero once growth exposes them.
    if old_length % SECTOR_SIZE != 0 {
        let last = bytes_to_sectors(old_length) - 1;
        let leaf = leaf_sector(cache, rec_guard.data::<InodeRecord>(), last);
        let mut g = slot(cache, leaf);
        g.bytes_mut()[old_length % SECTOR_SIZE..].fill(0);
    }

    let start = bytes_to_sectors(old_length);
    let end = bytes_to_sectors(new_length);
    if start == end {
        rec_guard.data_mut::<InodeRecord>().set_length(new_length);
        return Ok(());
    }

    let new_indirect = start <= NUM_DIRECT && NUM_DIRECT < end;
    let new_doubly = start <= DOUBLY_BASE && DOUBLY_BASE < end;
    let first_second = second_level_tables(start);
    let last_second = second_level_tables(end);

    let needed = (end - start)
        + usize::from(new_indirect)
        + usize::from(new_doubly)
        + (last_second - first_second);
    if fm.available() < needed {
        return Err(Error::OutOfSpace);
    }

    // Claim every sector before wiring anything into the record, so a
    // failure has nothing to unwind beyond the claims themselves.
    let mut plan = GrowPlan::default();
    let res = (|| -> Result<(), Error> {
        if new_indirect {
            plan.indirect = Some(fm.allocate_contig(cache, 1)?);
        }
        if new_doubly {
            plan.doubly = Some(fm.allocate_contig(cache, 1)?);
        }
        fm.allocate_scatter(cache, last_second - first_second, &mut plan.seconds)?;
        fm.allocate_scatter(cache, end - start, &mut plan.leaves)?;
        Ok(())
    })();
    if let Err(e) = res {
        let mut claimed = plan.seconds;
        claimed.extend(plan.leaves);
        claimed.extend(plan.indirect);
        claimed.extend(plan.doubly);
        fm.release_scatter(cache, &claimed);
        return Err(e);
    }

    if let Some(tbl) = plan.indirect {
        slot_zeroed(cache, tbl);
        rec_guard.data_mut::<InodeRecord>().set_indirect(Some(tbl));
    }
    if let Some(tbl) = plan.doubly {
        slot_zeroed(cache, tbl);
        rec_guard.data_mut::<InodeRecord>().set_doubly_indirect(Some(tbl));
    }
    if !plan.seconds.is_empty() {
        for tbl in &plan.seconds {
            slot_zeroed(cache, *tbl);
        }
        let doubly = rec_guard.data::<InodeRecord>().doubly_indirect().unwrap();
        let mut dg = slot(cache, doubly);
        let view = dg.data_mut::<IndirectBlock>();
        for (i, tbl) in plan.seconds.iter().enumerate() {
            view.set(first_second + i, Some(*tbl));
        }
    }
    for leaf in &plan.leaves {
        slot_zeroed(cache, *leaf);
    }
    install_leaves(cache, rec_guard, start, &plan.leaves);
    rec_guard.data_mut::<InodeRecord>().set_length(new_length);
    Ok(())
}

/// Records the freshly allocated `leaves` as logical sectors
/// `start..start + leaves.len()`.
fn install_leaves<D: Disk>(
    cache: &Cache<D>,
    rec_guard: &mut Slot<'_, D>,
    start: usize,
    leaves: &[SectorNo],
) {
    let end = start + leaves.len();
    let mut next = 0;
    let mut idx = start;

    while idx < end && idx < NUM_DIRECT {
        rec_guard
            .data_mut::<InodeRecord>()
            .set_direct(idx, Some(leaves[next]));
        next += 1;
        idx += 1;
    }
    if idx < end && idx < DOUBLY_BASE {
        let tbl = rec_guard.data::<InodeRecord>().indirect().unwrap();
        let mut tg = slot(cache, tbl);
        let view = tg.data_mut::<IndirectBlock>();
        while idx < end && idx < DOUBLY_BASE {
            view.set(idx - NUM_DIRECT, Some(leaves[next]));
            next += 1;
            idx += 1;
        }
    }
    while idx < end {
        let ti = (idx - DOUBLY_BASE) / NUM_INDIRECT;
        let second = {
            let dg = slot(cache, rec_guard.data::<InodeRecord>().doubly_indirect().unwrap());
            dg.data::<IndirectBlock>().get(ti).unwrap()
        };
        let table_end = DOUBLY_BASE + (ti + 1) * NUM_INDIRECT;
        let mut tg = slot(cache, second);
        let view = tg.data_mut::<IndirectBlock>();
        while idx < end && idx < table_end {
            view.set((idx - DOUBLY_BASE) % NUM_INDIRECT, Some(leaves[next]));
            next += 1;
            idx += 1;
        }
    }
}

/// Shrinks the inode to `new_length`, releasing the data sectors past it
/// and any pointer table left without a referent.
pub(crate) fn truncate_to<D: Disk>(
    cache: &Cache<D>,
    fm: &mut FreeMapInner,
    rec_guard: &mut Slot<'_, D>,
    new_length: usize,
) {
    let old_length = rec_guard.data::<InodeRecord>().length();
    assert!(new_length <= old_length);
    let start = bytes_to_sectors(new_length);
    let end = bytes_to_sectors(old_length);

    if start < end {
        release_leaves(cache, fm, rec_guard, start, end);

        if start <= NUM_DIRECT && NUM_DIRECT < end {
            let rec = rec_guard.data_mut::<InodeRecord>();
            let tbl = rec.indirect().unwrap();
            rec.set_indirect(None);
            fm.release_contig(cache, tbl, 1);
        }

        let keep = second_level_tables(start);
        let have = second_level_tables(end);
        if have > keep {
            let doubly = rec_guard.data::<InodeRecord>().doubly_indirect().unwrap();
            let mut tables = ArrayVec::<SectorNo, NUM_INDIRECT>::new();
            {
                let mut dg = slot(cache, doubly);
                let view = dg.data_mut::<IndirectBlock>();
                for i in keep..have {
                    tables.push(view.get(i).unwrap());
                    view.set(i, None);
                }
            }
            fm.release_scatter(cache, &tables);
        }

        if start <= DOUBLY_BASE && DOUBLY_BASE < end {
            let rec = rec_guard.data_mut::<InodeRecord>();
            let tbl = rec.doubly_indirect().unwrap();
            rec.set_doubly_indirect(None);
            fm.release_contig(cache, tbl, 1);
        }
    }

    rec_guard.data_mut::<InodeRecord>().set_length(new_length);
}

/// Releases the physical sectors behind logical sectors `start..end` and
/// clears their pointer slots.
fn release_leaves<D: Disk>(
    cache: &Cache<D>,
    fm: &mut FreeMapInner,
    rec_guard: &mut Slot<'_, D>,
    start: usize,
    end: usize,
) {
    if start < NUM_DIRECT {
        let hi = usize::min(end, NUM_DIRECT);
        let mut batch = ArrayVec::<SectorNo, NUM_DIRECT>::new();
        let rec = rec_guard.data_mut::<InodeRecord>();
        for i in start..hi {
            batch.push(rec.direct(i).unwrap());
            rec.set_direct(i, None);
        }
        fm.release_scatter(cache, &batch);
    }

    if start < DOUBLY_BASE && NUM_DIRECT < end {
        let lo = usize::max(start, NUM_DIRECT) - NUM_DIRECT;
        let hi = usize::min(end, DOUBLY_BASE) - NUM_DIRECT;
        let tbl = rec_guard.data::<InodeRecord>().indirect().unwrap();
        let mut batch = ArrayVec::<SectorNo, NUM_INDIRECT>::new();
        {
            let mut tg = slot(cache, tbl);
            let view = tg.data_mut::<IndirectBlock>();
            for i in lo..hi {
                batch.push(view.get(i).unwrap());
                view.set(i, None);
            }
        }
        fm.release_scatter(cache, &batch);
    }

    if DOUBLY_BASE < end {
        let lo = usize::max(start, DOUBLY_BASE) - DOUBLY_BASE;
        let hi = end - DOUBLY_BASE;
        let doubly = rec_guard.data::<InodeRecord>().doubly_indirect().unwrap();
        let mut i = lo;
        while i < hi {
            let ti = i / NUM_INDIRECT;
            let second = {
                let dg = slot(cache, doubly);
                dg.data::<IndirectBlock>().get(ti).unwrap()
            };
            let table_end = usize::min(hi, (ti + 1) * NUM_INDIRECT);
            let mut batch = ArrayVec::<SectorNo, NUM_INDIRECT>::new();
            {
                let mut tg = slot(cache, second);
                let view = tg.data_mut::<IndirectBlock>();
                while i < table_end {
                    batch.push(view.get(i % NUM_INDIRECT).unwrap());
                    view.set(i % NUM_INDIRECT, None);
                    i += 1;
                }
            }
            fm.release_scatter(cache, &batch);
        }
    }
}
