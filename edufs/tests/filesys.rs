use std::{thread, time::Duration};

use edufs::{
    Error, Filesys, MAX_LENGTH, NUM_DIRECT, NUM_INDIRECT, Options, RamDisk, SECTOR_SIZE,
};

fn format(sector_count: usize) -> (RamDisk, Filesys<RamDisk>) {
    let disk = RamDisk::new(sector_count);
    let fs = Filesys::format(disk.clone(), &Options::default());
    (disk, fs)
}

#[test]
fn create_fill_read_back() {
    let (_disk, fs) = format(1024);
    let file = fs.create_inode(0, false).unwrap();

    let data: Vec<u8> = (0..1024_usize).map(|i| i as u8).collect();
    assert_eq!(file.write_at(0, &data), 1024);
    assert_eq!(file.length(), 1024);

    let mut out = vec![0; 1024];
    assert_eq!(file.read_at(0, &mut out), 1024);
    assert_eq!(out, data);
}

#[test]
fn growth_across_indirect_boundary() {
    let (_disk, fs) = format(1024);
    let file = fs.create_inode(0, false).unwrap();

    let off = NUM_DIRECT * SECTOR_SIZE;
    assert_eq!(file.write_at(off, &[0xAB]), 1);
    assert_eq!(file.length(), off + 1);

    let mut out = vec![1_u8; off + 1];
    assert_eq!(file.read_at(0, &mut out), off + 1);
    assert!(out[..off].iter().all(|&b| b == 0));
    assert_eq!(out[off], 0xAB);
}

#[test]
fn growth_across_doubly_indirect_boundary() {
    let (_disk, fs) = format(2048);
    let file = fs.create_inode(0, false).unwrap();

    let off = (NUM_DIRECT + NUM_INDIRECT) * SECTOR_SIZE;
    assert_eq!(file.write_at(off, &[0xCD]), 1);
    assert_eq!(file.length(), off + 1);

    let mut out = vec![1_u8; off + 1];
    assert_eq!(file.read_at(0, &mut out), off + 1);
    assert!(out[..off].iter().all(|&b| b == 0));
    assert_eq!(out[off], 0xCD);
}

#[test]
fn remove_releases_full_footprint() {
    let (_disk, fs) = format(2048);
    let before = fs.available_sectors();

    let file = fs.create_inode(128 * 1024, false).unwrap();
    assert!(fs.available_sectors() < before);

    file.remove();
    drop(file);
    assert_eq!(fs.available_sectors(), before);
}

#[test]
fn removal_waits_for_last_close() {
    let (_disk, fs) = format(256);
    let before = fs.available_sectors();

    let file = fs.create_inode(4096, false).unwrap();
    let dup = file.clone();

    file.remove();
    drop(file);

    // Still open through `dup`: nothing released yet.
    assert!(fs.available_sectors() < before);
    assert_eq!(dup.length(), 4096);

    drop(dup);
    assert_eq!(fs.available_sectors(), before);
}

#[test]
fn concurrent_writers_to_disjoint_ranges() {
    const HALF: usize = 64 * 1024;

    let (_disk, fs) = format(2048);
    let file = fs.create_inode(0, false).unwrap();

    let h1 = file.clone();
    let h2 = file.clone();
    let t1 = thread::spawn(move || {
        assert_eq!(h1.write_at(0, &vec![0x11; HALF]), HALF);
    });
    let t2 = thread::spawn(move || {
        assert_eq!(h2.write_at(HALF, &vec![0x22; HALF]), HALF);
    });
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(file.length(), 2 * HALF);
    let mut out = vec![0; 2 * HALF];
    assert_eq!(file.read_at(0, &mut out), 2 * HALF);
    assert!(out[..HALF].iter().all(|&b| b == 0x11));
    assert!(out[HALF..].iter().all(|&b| b == 0x22));
}

#[test]
fn out_of_space_create_is_side_effect_free() {
    let (_disk, fs) = format(64);
    let before = fs.available_sectors();

    assert_eq!(fs.create_inode(MAX_LENGTH, false).unwrap_err(), Error::OutOfSpace);
    assert_eq!(fs.available_sectors(), before);
}

#[test]
fn caller_chosen_sector_workflow() {
    let (_disk, fs) = format(256);
    let before = fs.available_sectors();

    let sector = fs.allocate_sector().unwrap();
    fs.create_at(sector, 0, false).unwrap();
    let file = fs.open(sector);
    assert_eq!(file.sector(), sector);
    assert_eq!(file.write_at(0, b"pinned"), 6);
    let mut out = [0_u8; 6];
    assert_eq!(file.read_at(0, &mut out), 6);
    assert_eq!(&out, b"pinned");

    // A failed create hands its sector back through release_sector.
    let spare = fs.allocate_sector().unwrap();
    assert_eq!(fs.create_at(spare, MAX_LENGTH, false), Err(Error::OutOfSpace));
    fs.release_sector(spare);

    file.remove();
    drop(file);
    assert_eq!(fs.available_sectors(), before);
}

#[test]
fn deny_write_blocks_writes() {
    let (_disk, fs) = format(256);
    let file = fs.create_inode(0, false).unwrap();

    assert_eq!(file.write_at(0, b"hi"), 2);

    file.deny_write();
    assert_eq!(file.write_at(2, b"more"), 0);
    assert_eq!(file.length(), 2);

    file.allow_write();
    assert_eq!(file.write_at(2, b"!!"), 2);
    assert_eq!(file.length(), 4);
}

#[test]
fn directory_metadata() {
    let (_disk, fs) = format(256);
    let root = fs.root();
    assert!(root.is_dir());
    assert_eq!(root.num_children(), 0);
    assert_eq!(root.parent_sector(), root.sector());

    let child = fs.create_inode(0, false).unwrap();
    root.add_child(child.sector()).unwrap();
    assert_eq!(root.num_children(), 1);
    assert_eq!(child.parent_sector(), root.sector());

    assert_eq!(child.add_child(root.sector()), Err(Error::NotADirectory));
    assert_eq!(child.remove_child(), Err(Error::NotADirectory));

    root.remove_child().unwrap();
    assert_eq!(root.num_children(), 0);
}

#[test]
fn shrink_then_fresh_create_footprints_match() {
    let (_disk, fs) = format(2048);

    let a = fs.create_inode(0, false).unwrap();
    let base = fs.available_sectors();

    assert_eq!(a.write_at(0, &vec![1; 300 * SECTOR_SIZE]), 300 * SECTOR_SIZE);
    a.truncate(100 * SECTOR_SIZE);
    assert_eq!(a.length(), 100 * SECTOR_SIZE);
    let shrunk_footprint = base - fs.available_sectors();

    let avail = fs.available_sectors();
    let _b = fs.create_inode(100 * SECTOR_SIZE, false).unwrap();
    let fresh_footprint = avail - fs.available_sectors() - 1; // minus b's record

    assert_eq!(shrunk_footprint, fresh_footprint);

    let before_empty = fs.available_sectors();
    a.truncate(0);
    assert_eq!(a.length(), 0);
    assert_eq!(fs.available_sectors(), before_empty + shrunk_footprint);
}

#[test]
fn zero_length_edge_cases() {
    let (_disk, fs) = format(256);
    let file = fs.create_inode(0, false).unwrap();

    assert_eq!(file.write_at(0, &[]), 0);
    assert_eq!(file.read_at(0, &mut []), 0);
    assert_eq!(file.length(), 0);

    assert_eq!(file.write_at(0, b"abc"), 3);
    let mut out = [0_u8; 8];
    // Reads starting exactly at the length return nothing.
    assert_eq!(file.read_at(3, &mut out), 0);
    // Reads crossing the length are clamped.
    assert_eq!(file.read_at(1, &mut out), 2);
    assert_eq!(&out[..2], b"bc");
}

#[test]
fn survives_remount() {
    let disk = RamDisk::new(1024);
    let sector;
    let available;
    {
        let fs = Filesys::format(disk.clone(), &Options::default());
        let file = fs.create_inode(0, false).unwrap();
        sector = file.sector();
        assert_eq!(file.write_at(0, b"persistent bytes"), 16);
        drop(file);
        available = fs.available_sectors();
        fs.unmount();
    }
    assert!(disk.writes() > 0);

    let fs = Filesys::mount(disk.clone(), &Options::default());
    assert_eq!(fs.available_sectors(), available);

    let file = fs.open(sector);
    let mut out = [0_u8; 16];
    assert_eq!(file.read_at(0, &mut out), 16);
    assert_eq!(&out, b"persistent bytes");
}

#[test]
fn write_behind_flushes_on_its_own() {
    let disk = RamDisk::new(256);
    let fs = Filesys::format(
        disk.clone(),
        &Options {
            cache_slots: 16,
            write_delay: Duration::from_millis(50),
        },
    );

    let file = fs.create_inode(0, false).unwrap();
    assert_eq!(file.write_at(0, &[9; SECTOR_SIZE]), SECTOR_SIZE);
    let before = disk.writes();

    // No explicit flush: the background task must push the dirty slots out.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while disk.writes() == before {
        assert!(std::time::Instant::now() < deadline, "write-behind never ran");
        thread::sleep(Duration::from_millis(10));
    }
}
