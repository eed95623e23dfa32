use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use crate::{
	blockdev::{Backend, BlockDev},
	codec::{Config, Decoder},
	data::*,
	err,
	lfs::{DirtyInodes, EngineState, Imap, Lfs, LogState, UsageTable},
};

macro_rules! geobail {
	($($tk:tt)+) => {
		return Err(IoError::new(ErrorKind::InvalidInput, format!($($tk)+)))
	};
}

/// First segment starts after boot, superblock and the two checkpoints.
const SEGSTART: u32 = 4;

fn superblock_for(geo: &FormatGeometry) -> IoResult<Superblock> {
	if geo.segsize <= 4 {
		geobail!("segment size {} too small", geo.segsize);
	}
	if geo.size <= SEGSTART + geo.segsize {
		geobail!("image size {} too small", geo.size);
	}
	if geo.ninodes < 2 || geo.ninodes as usize > NIMAP_BLOCKS * IMAP_PER_BLOCK {
		geobail!("bad inode count {}", geo.ninodes);
	}

	let nsegs = (geo.size - SEGSTART) / geo.segsize;
	if nsegs as usize > NSUT_BLOCKS * SUT_PER_BLOCK {
		geobail!("too many segments ({nsegs}) for the usage table");
	}

	Ok(Superblock {
		magic:       LFS_MAGIC,
		size:        geo.size,
		nsegs,
		segsize:     geo.segsize,
		segstart:    SEGSTART,
		ninodes:     geo.ninodes,
		checkpoint0: 2,
		checkpoint1: 3,
	})
}

/// Write a fresh file system onto `dev`: zeroed image, superblock, root
/// directory with `.` and `..`, and a committed checkpoint. Returns the
/// mounted engine.
pub fn format<R: Backend>(dev: BlockDev<R>, geo: &FormatGeometry) -> IoResult<Lfs<R>> {
	let sb = superblock_for(geo)?;
	log::info!(
		"format: size {} nsegs {} segsize {} segstart {} ninodes {}",
		sb.size,
		sb.nsegs,
		sb.segsize,
		sb.segstart,
		sb.ninodes
	);

	let mut file = Decoder::new(dev, Config::little());
	if !file.inner().write_enabled() {
		return Err(err!(EROFS));
	}

	let zeroes = [0u8; BSIZE];
	for bno in 0..sb.size {
		file.write_at(bno as u64 * BSIZE as u64, &zeroes)?;
	}
	file.encode_at(SBLOCK as u64 * BSIZE as u64, &sb)?;

	let mut fs = Lfs {
		log: LogState::fresh(&sb),
		imap: Imap::new(sb.ninodes),
		sut: UsageTable::new_free(sb.nsegs),
		cp: Checkpoint::default(),
		cp_slot: false,
		dirty: DirtyInodes::new(),
		state: EngineState::Idle,
		ticks: 0,
		superblock: sb,
		file,
	};
	fs.sut.mark_used(0, 0);

	let root = fs.inode_alloc(InodeType::Directory)?;
	assert_eq!(root, ROOTINO, "root must get the first inode");
	let mut din = fs.read_inode(root)?;
	din.nlink = 1;
	fs.inode_update(root, &din)?;

	fs.dir_link(root, ".", root)?;
	fs.dir_link(root, "..", root)?;

	fs.sync()?;
	log::info!("format: log_tail at block {}", fs.log_tail());
	Ok(fs)
}
