use std::{collections::BTreeSet, io::Cursor};

use rstest::rstest;
use rulfs::*;

const GEO: FormatGeometry = FormatGeometry {
	size:    20000,
	segsize: 32,
	ninodes: 200,
};

/// Tight geometry for the garbage-collection scenarios.
const SMALL: FormatGeometry = FormatGeometry {
	size:    4 + 120 * 32,
	segsize: 32,
	ninodes: 200,
};

type MemFs = Lfs<Cursor<Vec<u8>>>;

fn mkfs(geo: &FormatGeometry) -> MemFs {
	let img = Cursor::new(vec![0u8; geo.size as usize * BSIZE]);
	format(BlockDev::new(img, true), geo).unwrap()
}

/// Take the raw image; since the engine writes through, this is exactly
/// what a crash would leave on disk.
fn image(fs: MemFs) -> Vec<u8> {
	fs.into_backend().unwrap().into_inner()
}

fn mount(img: Vec<u8>) -> MemFs {
	Lfs::new(BlockDev::new(Cursor::new(img), true)).unwrap()
}

fn crash(fs: MemFs) -> MemFs {
	mount(image(fs))
}

fn write_file(fs: &mut MemFs, path: &str, data: &[u8]) -> u32 {
	let inum = fs.create(path, InodeType::RegularFile).unwrap();
	assert_eq!(fs.inode_write(inum, 0, data).unwrap(), data.len());
	inum
}

fn read_file(fs: &mut MemFs, path: &str) -> Vec<u8> {
	let inum = fs.lookup_path(path).unwrap();
	let attr = fs.inode_attr(inum).unwrap();
	let mut buf = vec![0u8; attr.size as usize];
	assert_eq!(fs.inode_read(inum, 0, &mut buf).unwrap(), buf.len());
	buf
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
	(0..len)
		.map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
		.collect()
}

/// Every imap-reachable block: inode blocks, data blocks, indirect
/// blocks. Files in these tests have no holes, so `bmap` never allocates.
fn reachable_blocks(fs: &mut MemFs) -> Vec<u32> {
	let sb = fs.superblock().clone();
	let mut seen = BTreeSet::new();
	for inum in 1..sb.ninodes {
		let ImapSlot::Located(loc) = fs.imap_entry(inum) else {
			continue;
		};
		seen.insert(loc.block);
		let din = fs.read_inode(inum).unwrap();
		for bn in 0..(din.size as usize).div_ceil(BSIZE) {
			seen.insert(fs.bmap(inum, bn as u32).unwrap());
		}
		if din.addrs[NDIRECT] != 0 {
			seen.insert(din.addrs[NDIRECT]);
		}
	}
	seen.into_iter().collect()
}

/// Invariant check: the usage table of every non-free segment matches the
/// reachable tree exactly. Only meaningful right after a sync, when the
/// dirty buffer is empty.
fn check_live_accounting(fs: &mut MemFs) {
	let sb = fs.superblock().clone();
	let mut per_seg = vec![0u32; sb.nsegs as usize];
	for bno in reachable_blocks(fs) {
		per_seg[sb.seg_of(bno) as usize] += BSIZE as u32;
	}

	for s in 0..sb.nsegs {
		match fs.segment_live_bytes(s) {
			None => assert_eq!(per_seg[s as usize], 0, "free segment {s} holds live blocks"),
			Some(live) => assert_eq!(live, per_seg[s as usize], "segment {s} live bytes"),
		}
	}
}

/// Invariant check: data and indirect blocks never occupy the two
/// reserved blocks at the end of a segment; inode blocks never occupy the
/// summary block.
fn check_reservation(fs: &mut MemFs) {
	let sb = fs.superblock().clone();
	for inum in 1..sb.ninodes {
		let ImapSlot::Located(loc) = fs.imap_entry(inum) else {
			continue;
		};
		let off = (loc.block - sb.segstart) % sb.segsize;
		assert!(off < sb.segsize - 1, "inode block {} in summary slot", loc.block);

		let din = fs.read_inode(inum).unwrap();
		for bn in 0..(din.size as usize).div_ceil(BSIZE) {
			let a = fs.bmap(inum, bn as u32).unwrap();
			let off = (a - sb.segstart) % sb.segsize;
			assert!(off < sb.segsize - 2, "data block {a} in reserved window");
		}
		if din.addrs[NDIRECT] != 0 {
			let off = (din.addrs[NDIRECT] - sb.segstart) % sb.segsize;
			assert!(off < sb.segsize - 2, "indirect block in reserved window");
		}
	}
}

fn read_all_files(fs: &mut MemFs) -> Vec<(String, Vec<u8>)> {
	let mut out = Vec::new();
	for (name, _) in fs.read_dir(ROOTINO).unwrap() {
		if name == "." || name == ".." {
			continue;
		}
		let data = read_file(fs, &format!("/{name}"));
		out.push((name, data));
	}
	out.sort();
	out
}

#[test]
fn format_creates_root() {
	let mut fs = mkfs(&GEO);
	let sb = fs.superblock().clone();

	let cp = fs.checkpoint();
	assert_eq!(cp.valid, 1);
	assert_eq!(cp.log_tail, fs.log_tail());

	let ImapSlot::Located(loc) = fs.imap_entry(ROOTINO) else {
		panic!("root not in imap");
	};
	assert_eq!(loc.slot, 0);
	assert_eq!(sb.seg_of(loc.block), 0);

	let attr = fs.inode_attr(ROOTINO).unwrap();
	assert_eq!(attr.kind, InodeType::Directory);
	assert_eq!(attr.size, 2 * DIRENT_SIZE as u32);

	let entries = fs.read_dir(ROOTINO).unwrap();
	assert_eq!(entries, vec![(".".to_string(), 1), ("..".to_string(), 1)]);

	check_live_accounting(&mut fs);
}

#[test]
fn survives_crash_across_checkpoint() {
	let mut fs = mkfs(&GEO);

	write_file(&mut fs, "/a", b"HELLO\n");
	fs.sync().unwrap();

	write_file(&mut fs, "/b", b"WORLD\n");
	// no sync: /b must not survive the crash

	let mut fs = crash(fs);
	assert_eq!(read_file(&mut fs, "/a"), b"HELLO\n");
	match fs.lookup_path("/b") {
		Err(e) => assert_eq!(e.raw_os_error(), Some(libc::ENOENT)),
		Ok(inum) => assert_eq!(fs.inode_attr(inum).unwrap().size, 0),
	}
	check_live_accounting(&mut fs);
}

#[test]
fn cleaner_reclaims_fragmentation() {
	const FILESIZE: usize = 16 * 1024;
	let mut fs = mkfs(&SMALL);

	for i in 0..40 {
		write_file(&mut fs, &format!("/f{i:02}"), &pattern(FILESIZE, i));
	}
	for i in (0..40).step_by(2) {
		fs.unlink(&format!("/f{i:02}")).unwrap();
	}
	for i in 0..20 {
		write_file(&mut fs, &format!("/g{i:02}"), &pattern(FILESIZE, 100 + i));
	}

	// the write traffic above normally drives the cleaner on its own
	if fs.free_ring().is_empty() {
		fs.clean().unwrap();
	}
	fs.sync().unwrap();

	let ring = fs.free_ring();
	assert!(!ring.is_empty(), "cleaner reclaimed nothing");
	for s in ring {
		assert_eq!(fs.segment_live_bytes(s), None, "ring segment {s} not marked free");
	}

	for i in (1..40).step_by(2) {
		assert_eq!(read_file(&mut fs, &format!("/f{i:02}")), pattern(FILESIZE, i));
	}
	for i in 0..20 {
		assert_eq!(
			read_file(&mut fs, &format!("/g{i:02}")),
			pattern(FILESIZE, 100 + i)
		);
	}

	check_live_accounting(&mut fs);
	check_reservation(&mut fs);

	// and everything still holds after a crash
	let mut fs = crash(fs);
	for i in (1..40).step_by(2) {
		assert_eq!(read_file(&mut fs, &format!("/f{i:02}")), pattern(FILESIZE, i));
	}
	check_live_accounting(&mut fs);
}

#[test]
fn partial_block_write_redirects_block() {
	let mut fs = mkfs(&GEO);
	let initial = pattern(600, 7);
	let inum = write_file(&mut fs, "/part", &initial);
	fs.sync().unwrap();

	let old = fs.bmap(inum, 0).unwrap();
	assert_eq!(fs.inode_write(inum, 100, b"xxxxx").unwrap(), 5);

	let new = fs.bmap(inum, 0).unwrap();
	assert_ne!(new, old, "partial write must go to a fresh log block");

	let mut expect = initial.clone();
	expect[100..105].copy_from_slice(b"xxxxx");
	assert_eq!(read_file(&mut fs, "/part"), expect);

	fs.sync().unwrap();
	check_live_accounting(&mut fs);
}

#[test]
fn version_blocks_stale_relocation() {
	let mut fs = mkfs(&GEO);
	let inum = write_file(&mut fs, "/v", &pattern(4096, 3));
	fs.sync().unwrap();

	let v0 = match fs.imap_entry(inum) {
		ImapSlot::Located(loc) => loc.version,
		other => panic!("unexpected imap entry {other:?}"),
	};

	fs.inode_truncate(inum).unwrap();
	fs.sync().unwrap();
	let v1 = match fs.imap_entry(inum) {
		ImapSlot::Located(loc) => loc.version,
		other => panic!("unexpected imap entry {other:?}"),
	};
	assert_eq!(v1, v0.wrapping_add(1));

	let fresh = pattern(4096, 9);
	assert_eq!(fs.inode_write(inum, 0, &fresh).unwrap(), fresh.len());
	fs.sync().unwrap();

	// a cleaner pass over the segments holding the version-v0 entries
	// must not resurrect the truncated blocks
	fs.clean().unwrap();
	assert_eq!(read_file(&mut fs, "/v"), fresh);
	check_live_accounting(&mut fs);
}

#[test]
fn filled_segments_end_with_summary() {
	let mut fs = mkfs(&GEO);
	let sb = fs.superblock().clone();

	// three segments' worth of data guarantees segments 0 and 1 filled
	write_file(&mut fs, "/big", &pattern(3 * 32 * BSIZE, 1));
	fs.sync().unwrap();

	let img = image(fs);
	for seg in 0..2u32 {
		let last = (sb.seg_first(seg) + sb.segsize - 1) as usize;
		let block = &img[last * BSIZE..(last + 1) * BSIZE];
		let (hdr, entries) = parse_ssb(block).unwrap_or_else(|| {
			panic!("segment {seg}: block {last} is not a valid summary")
		});
		assert_eq!(hdr.magic, SSB_MAGIC);
		assert_eq!(hdr.nblocks as usize, entries.len());
	}

	let mut fs = mount(img);
	assert_eq!(read_file(&mut fs, "/big"), pattern(3 * 32 * BSIZE, 1));
}

#[rstest]
#[case(0, 1)]
#[case(100, 5)]
#[case(511, 2)]
#[case(512, 512)]
#[case(600, 5000)]
#[case(0, 13 * BSIZE)]
fn round_trip_across_crash(#[case] off: usize, #[case] len: usize) {
	let mut fs = mkfs(&GEO);
	let base = pattern(off, 11);
	let payload = pattern(len, 42);

	let inum = write_file(&mut fs, "/rt", &base);
	assert_eq!(fs.inode_write(inum, off as u32, &payload).unwrap(), len);
	fs.sync().unwrap();

	let mut fs = crash(fs);
	let inum = fs.lookup_path("/rt").unwrap();
	let mut buf = vec![0u8; len];
	assert_eq!(fs.inode_read(inum, off as u32, &mut buf).unwrap(), len);
	assert_eq!(buf, payload);
}

#[test]
fn idempotent_sync() {
	let mut fs = mkfs(&GEO);
	write_file(&mut fs, "/x", b"data");
	fs.sync().unwrap();

	let tail = fs.log_tail();
	let ts = fs.checkpoint().timestamp;

	fs.sync().unwrap();
	assert_eq!(fs.log_tail(), tail, "second sync wrote imap/SUT blocks");
	assert_eq!(fs.checkpoint().timestamp, ts);
}

#[test]
fn checkpoint_commit_is_atomic() {
	let mut fs = mkfs(&GEO);
	write_file(&mut fs, "/c", b"ccc");
	fs.sync().unwrap();

	let sb = fs.superblock().clone();
	let cp = fs.checkpoint().clone();
	assert_eq!(cp.log_tail, fs.log_tail());
	let first = sb.seg_first(cp.cur_seg);
	assert!(cp.log_tail >= first && cp.log_tail < first + sb.segsize);

	// one of the two slots carries the committed timestamp at both ends
	let img = image(fs);
	let committed = [sb.checkpoint0, sb.checkpoint1]
		.iter()
		.map(|&b| &img[b as usize * BSIZE..(b as usize + 1) * BSIZE])
		.any(|blk| {
			blk[0..4] == cp.timestamp.to_le_bytes()
				&& blk[BSIZE - 4..] == cp.timestamp.to_le_bytes()
		});
	assert!(committed, "no slot holds the committed timestamp twice");
}

#[test]
fn cleaner_preserves_file_contents() {
	let mut fs = mkfs(&SMALL);
	for i in 0..10 {
		write_file(&mut fs, &format!("/k{i}"), &pattern(8192, i));
	}
	for i in [1, 4, 7] {
		fs.unlink(&format!("/k{i}")).unwrap();
	}
	fs.sync().unwrap();

	let before = read_all_files(&mut fs);
	fs.clean().unwrap();
	let after = read_all_files(&mut fs);
	assert_eq!(before, after);
	check_live_accounting(&mut fs);
}

#[test]
fn reservation_policy_holds_under_load() {
	let mut fs = mkfs(&GEO);
	for i in 0..6 {
		write_file(&mut fs, &format!("/r{i}"), &pattern(30 * BSIZE, i));
	}
	fs.sync().unwrap();
	check_reservation(&mut fs);
	check_live_accounting(&mut fs);
}

#[test]
fn indirect_range_boundary() {
	let mut fs = mkfs(&GEO);
	let inum = fs.create("/max", InodeType::RegularFile).unwrap();

	// grow to the largest representable file, one block at a time near
	// the end so the last write lands exactly on block MAXFILE - 1
	let most = pattern((MAXFILE - 1) * BSIZE, 5);
	assert_eq!(fs.inode_write(inum, 0, &most).unwrap(), most.len());
	let last = pattern(BSIZE, 6);
	assert_eq!(
		fs.inode_write(inum, ((MAXFILE - 1) * BSIZE) as u32, &last).unwrap(),
		BSIZE
	);

	let e = fs
		.inode_write(inum, (MAXFILE * BSIZE) as u32, b"x")
		.unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::EFBIG));

	fs.sync().unwrap();
	let mut buf = vec![0u8; BSIZE];
	fs.inode_read(inum, ((MAXFILE - 1) * BSIZE) as u32, &mut buf).unwrap();
	assert_eq!(buf, last);
}

#[test]
fn unlink_frees_inode_across_restart() {
	let mut fs = mkfs(&GEO);
	write_file(&mut fs, "/keep", b"keep");
	let gone = write_file(&mut fs, "/gone", &pattern(2048, 8));
	fs.sync().unwrap();

	fs.unlink("/gone").unwrap();

	let mut fs = crash(fs);
	assert_eq!(read_file(&mut fs, "/keep"), b"keep");
	let e = fs.lookup_path("/gone").unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::ENOENT));
	assert_eq!(fs.imap_entry(gone), ImapSlot::Free);
	check_live_accounting(&mut fs);
}

#[test]
fn directories_nest_and_unlink() {
	let mut fs = mkfs(&GEO);
	fs.create("/d", InodeType::Directory).unwrap();
	write_file(&mut fs, "/d/f", b"nested");
	fs.sync().unwrap();

	assert_eq!(read_file(&mut fs, "/d/f"), b"nested");

	let e = fs.unlink("/d").unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::ENOTEMPTY));

	fs.unlink("/d/f").unwrap();
	fs.unlink("/d").unwrap();
	assert!(fs.lookup_path("/d").is_err());
	check_live_accounting(&mut fs);
}

#[test]
fn mount_rejects_blank_image() {
	let img = Cursor::new(vec![0u8; 1024 * BSIZE]);
	assert!(Lfs::new(BlockDev::new(img, true)).is_err());
}
