use std::{
	fs::File,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	path::Path,
};

mod alloc;
mod checkpoint;
mod cleaner;
mod content;
mod dir;
mod imap;
mod inode;
mod usage;

use crate::{
	blockdev::{Backend, BlockDev},
	codec::{Config, Decoder},
	data::*,
};

pub(crate) use self::{alloc::LogState, imap::Imap, inode::DirtyInodes, usage::UsageTable};

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		IoError::from_raw_os_error(libc::$name)
	};
}

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(IoError::new($kind, format!($($tk)+)))
	};
}

/// Summary of filesystem statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Number of blocks.
	pub blocks: u64,

	/// Number of segments.
	pub segments: u64,

	/// Number of free segments (virgin area plus reclaimed ring).
	pub sfree: u64,

	/// Number of inodes.
	pub files: u64,

	/// Number of free inodes.
	pub ffree: u64,

	/// Block size.
	pub bsize: u32,

	/// Segment size in blocks.
	pub segsize: u32,
}

/// Engine phase; external mutating operations are only admitted while
/// `Idle`, and `sync`/cleaner re-entry is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
	Idle,
	Serving,
	Syncing,
	Cleaning,
}

/// Log-structured file system storage engine.
///
/// All state that the original kernel kept in process-wide singletons lives
/// behind this handle; exclusive access through `&mut self` is what the
/// engine spin lock used to provide.
pub struct Lfs<R: Backend> {
	pub(crate) file:       Decoder<BlockDev<R>>,
	pub(crate) superblock: Superblock,

	/// Last committed checkpoint, also the working copy for the next one.
	pub(crate) cp:      Checkpoint,
	/// Which checkpoint block the next sync writes to.
	pub(crate) cp_slot: bool,

	pub(crate) imap:  Imap,
	pub(crate) sut:   UsageTable,
	pub(crate) log:   LogState,
	pub(crate) dirty: DirtyInodes,

	pub(crate) state: EngineState,
	/// Coarse engine clock; advanced by sync and cleaner runs. Stands in
	/// for the kernel tick counter.
	pub(crate) ticks: u32,
}

impl Lfs<File> {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let file = BlockDev::open(path, rw)?;
		Self::new(file)
	}
}

impl<R: Backend> Lfs<R> {
	pub fn new(file: BlockDev<R>) -> IoResult<Self> {
		let mut file = Decoder::new(file, Config::little());

		let superblock: Superblock = file.decode_at(SBLOCK as u64 * BSIZE as u64)?;
		if superblock.magic != LFS_MAGIC {
			iobail!(
				ErrorKind::InvalidInput,
				"invalid superblock magic number: {:#x}",
				superblock.magic
			);
		}

		let (cp, newest) = checkpoint::read_newest(&mut file, &superblock)?;
		let imap = checkpoint::read_imap(&mut file, &superblock, &cp)?;
		let sut = checkpoint::read_sut(&mut file, &superblock, &cp)?;
		let log = LogState::rebuild(&superblock, &cp, &sut);
		let ticks = cp.timestamp;

		let mut s = Self {
			file,
			superblock,
			cp,
			cp_slot: !newest,
			imap,
			sut,
			log,
			dirty: DirtyInodes::new(),
			state: EngineState::Idle,
			ticks,
		};
		// The sync that committed this checkpoint may have crossed into the
		// current segment only after its SUT blocks were written.
		if s.log.cur_seg < s.superblock.nsegs && s.sut.is_free(s.log.cur_seg) {
			let age = s.ticks as u16;
			s.sut.mark_used(s.log.cur_seg, age);
		}
		s.check()?;
		Ok(s)
	}

	pub fn write_enabled(&self) -> bool {
		self.file.inner().write_enabled()
	}

	pub(crate) fn assert_rw(&self) -> IoResult<()> {
		if self.write_enabled() {
			Ok(())
		} else {
			Err(err!(EROFS))
		}
	}

	/// Get filesystem metadata.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Info {
		let sb = &self.superblock;
		Info {
			blocks:   sb.size as u64,
			segments: sb.nsegs as u64,
			sfree:    self.free_segment_count() as u64,
			files:    sb.ninodes as u64,
			ffree:    self.imap.free_count() as u64,
			bsize:    BSIZE as u32,
			segsize:  sb.segsize,
		}
	}

	fn check(&mut self) -> IoResult<()> {
		let sb = &self.superblock;
		log::debug!("Superblock: {sb:#?}");

		log::info!("Summary:");
		log::info!("# Blocks: {}", sb.size);
		log::info!("# Segments: {}", sb.nsegs);
		log::info!("Segment Size: {} blocks", sb.segsize);
		log::info!("# Inodes: {}", sb.ninodes);
		log::info!("Log Tail: {}", self.log.log_tail);

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					log::error!("superblock corrupted: {}", stringify!($e));
					return Err(IoError::from_raw_os_error(libc::EIO));
				}
			};
		}

		sbassert!(sb.nsegs > 0);
		sbassert!(sb.segsize > 4);
		sbassert!(sb.ninodes > 1);
		sbassert!(sb.segstart >= 4);
		sbassert!(sb.segstart + sb.nsegs * sb.segsize <= sb.size);
		sbassert!(sb.checkpoint0 < sb.segstart && sb.checkpoint1 < sb.segstart);
		sbassert!(sb.imap_nblocks() <= NIMAP_BLOCKS);
		sbassert!(sb.sut_nblocks() <= NSUT_BLOCKS);

		let cp = &self.cp;
		sbassert!(cp.valid != 0);
		sbassert!(cp.cur_seg < sb.nsegs);
		sbassert!(cp.seg_offset < sb.segsize);
		sbassert!(cp.log_tail == sb.seg_first(cp.cur_seg) + cp.seg_offset);
		sbassert!(cp.imap_nblocks as usize == sb.imap_nblocks());
		sbassert!(cp.sut_nblocks as usize == sb.sut_nblocks());

		log::info!("OK");
		Ok(())
	}

	pub(crate) fn block_pos(&self, bno: u32) -> u64 {
		bno as u64 * BSIZE as u64
	}

	pub(crate) fn read_block(&mut self, bno: u32, buf: &mut [u8; BSIZE]) -> IoResult<()> {
		debug_assert!(bno < self.superblock.size);
		self.file.read_at(self.block_pos(bno), buf)
	}

	pub(crate) fn write_block(&mut self, bno: u32, buf: &[u8; BSIZE]) -> IoResult<()> {
		debug_assert!(bno < self.superblock.size);
		self.file.write_at(self.block_pos(bno), buf)
	}

	/// Adjust the host segment's live-byte count and stamp its age. The
	/// count saturates at zero; any drop re-arms the cleaner trigger.
	pub(crate) fn update_usage(&mut self, bno: u32, delta: i32) {
		let seg = self.superblock.seg_of(bno);
		self.sut.add(seg, delta, self.ticks as u16);
		if delta < 0 {
			self.log.gc_failed = false;
		}
	}

	pub(crate) fn enter(&mut self, state: EngineState) -> IoResult<()> {
		if self.state != EngineState::Idle {
			log::warn!("engine busy: {:?} while {:?}", state, self.state);
			return Err(err!(EBUSY));
		}
		self.state = state;
		Ok(())
	}

	pub(crate) fn leave(&mut self) {
		self.state = EngineState::Idle;
	}

	pub fn superblock(&self) -> &Superblock {
		&self.superblock
	}

	// Introspection for consistency checking; not part of the kernel-facing
	// surface.

	/// The committed checkpoint.
	pub fn checkpoint(&self) -> &Checkpoint {
		&self.cp
	}

	/// Next log append position.
	pub fn log_tail(&self) -> u32 {
		self.log.log_tail
	}

	/// Live bytes recorded for segment `seg`, or `None` if it is free.
	pub fn segment_live_bytes(&self, seg: u32) -> Option<u32> {
		let e = self.sut.get(seg);
		if e.is_free() {
			None
		} else {
			Some(e.live as u32)
		}
	}

	/// Segments currently sitting in the reclaimed-segment ring.
	pub fn free_ring(&self) -> Vec<u32> {
		self.log.free_ring.iter().copied().collect()
	}

	/// Raw imap entry for `inum`.
	pub fn imap_entry(&self, inum: u32) -> ImapSlot {
		self.imap.get(inum)
	}

	/// Flush buffered writes and hand the backing medium back.
	pub fn into_backend(self) -> IoResult<R> {
		self.file.into_inner().into_inner()
	}
}

pub(crate) use iobail;
