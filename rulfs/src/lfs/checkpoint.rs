use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use super::{iobail, EngineState, Imap, Lfs, UsageTable};
use crate::{
	blockdev::{Backend, BlockDev},
	codec::Decoder,
	data::*,
};

fn blk_pos(bno: u32) -> u64 {
	bno as u64 * BSIZE as u64
}

/// Read one checkpoint slot; `None` for a torn or never-written one.
fn read_slot<R: Backend>(
	file: &mut Decoder<BlockDev<R>>,
	bno: u32,
) -> IoResult<Option<Checkpoint>> {
	let pos = blk_pos(bno);
	let cp: Checkpoint = file.decode_at(pos)?;
	let footer: u32 = file.decode_at(pos + BSIZE as u64 - 4)?;

	if cp.valid == 0 {
		return Ok(None);
	}
	if cp.timestamp != footer {
		log::warn!("checkpoint {bno}: torn write (header {} != footer {footer})", cp.timestamp);
		return Ok(None);
	}
	Ok(Some(cp))
}

/// Pick the newest consistent checkpoint of the two slots. Returns the
/// checkpoint and which slot it came from.
pub(crate) fn read_newest<R: Backend>(
	file: &mut Decoder<BlockDev<R>>,
	sb: &Superblock,
) -> IoResult<(Checkpoint, bool)> {
	let c0 = read_slot(file, sb.checkpoint0)?;
	let c1 = read_slot(file, sb.checkpoint1)?;

	match (c0, c1) {
		(Some(a), Some(b)) => {
			if a.timestamp >= b.timestamp {
				Ok((a, false))
			} else {
				Ok((b, true))
			}
		}
		(Some(a), None) => Ok((a, false)),
		(None, Some(b)) => Ok((b, true)),
		(None, None) => iobail!(ErrorKind::InvalidInput, "no valid checkpoint"),
	}
}

pub(crate) fn read_imap<R: Backend>(
	file: &mut Decoder<BlockDev<R>>,
	sb: &Superblock,
	cp: &Checkpoint,
) -> IoResult<Imap> {
	let n = (cp.imap_nblocks as usize).min(NIMAP_BLOCKS);
	let mut words = Vec::with_capacity(n * IMAP_PER_BLOCK);
	for i in 0..n {
		let arr: [u32; IMAP_PER_BLOCK] = file.decode_at(blk_pos(cp.imap_addrs[i]))?;
		words.extend_from_slice(&arr);
	}
	Ok(Imap::from_raw(&words, sb.ninodes))
}

pub(crate) fn read_sut<R: Backend>(
	file: &mut Decoder<BlockDev<R>>,
	sb: &Superblock,
	cp: &Checkpoint,
) -> IoResult<UsageTable> {
	let n = (cp.sut_nblocks as usize).min(NSUT_BLOCKS);
	let mut entries = Vec::with_capacity(n * SUT_PER_BLOCK);
	for i in 0..n {
		let arr: [SutEntry; SUT_PER_BLOCK] = file.decode_at(blk_pos(cp.sut_addrs[i]))?;
		entries.extend_from_slice(&arr);
	}
	Ok(UsageTable::from_raw(&entries, sb.nsegs))
}

impl<R: Backend> Lfs<R> {
	/// The sole durability point: flush the dirty inodes and the pending
	/// summary, persist changed SUT and imap blocks, then commit the
	/// checkpoint. Skipped entirely while a sync or the cleaner is already
	/// running, and when there is nothing to write.
	#[doc(alias = "lfs_sync")]
	pub fn sync(&mut self) -> IoResult<()> {
		if self.state != EngineState::Idle {
			log::trace!("sync: skipped while {:?}", self.state);
			return Ok(());
		}
		if self.dirty.is_empty()
			&& self.log.ssb.is_empty()
			&& !self.imap.is_dirty()
			&& !self.sut.is_dirty()
		{
			return Ok(());
		}
		self.assert_rw()?;

		self.state = EngineState::Syncing;
		let r = self.do_sync();
		self.state = EngineState::Idle;
		r
	}

	fn do_sync(&mut self) -> IoResult<()> {
		self.ticks = self.ticks.wrapping_add(1);

		self.flush_inodes()?;
		self.flush_ssb()?;
		self.write_sut()?;
		self.write_imap()?;
		self.write_checkpoint()?;

		log::debug!("sync: log_tail now {}", self.log.log_tail);
		Ok(())
	}

	/// Persist the usage table, skipping blocks identical to their last
	/// written copy.
	fn write_sut(&mut self) -> IoResult<()> {
		if !self.sut.is_dirty() {
			return Ok(());
		}
		let n = self.sut.nblocks();
		assert!(n <= NSUT_BLOCKS);

		for i in 0..n {
			if !self.sut.block_changed(i) && self.cp.sut_addrs[i] != 0 {
				continue;
			}
			let bno = self.log_alloc(None)?;
			let raw = self.sut.raw_block(i);
			self.file.encode_at(self.block_pos(bno), &raw)?;
			self.cp.sut_addrs[i] = bno;
			self.sut.commit_block(i);
		}
		self.cp.sut_nblocks = n as u32;
		self.sut.clear_dirty();
		Ok(())
	}

	fn write_imap(&mut self) -> IoResult<()> {
		if !self.imap.is_dirty() {
			return Ok(());
		}
		let n = self.imap.nblocks();
		assert!(n <= NIMAP_BLOCKS);

		for i in 0..n {
			let bno = self.log_alloc(None)?;
			let raw = self.imap.raw_block(i);
			self.file.encode_at(self.block_pos(bno), &raw)?;
			self.cp.imap_addrs[i] = bno;
		}
		self.cp.imap_nblocks = n as u32;
		self.imap.clear_dirty();
		Ok(())
	}

	/// Atomic commit: the checkpoint body opens with the timestamp and the
	/// block closes with the same value; recovery discards a slot whose
	/// two copies disagree. Writes alternate between the two slots.
	fn write_checkpoint(&mut self) -> IoResult<()> {
		self.cp.timestamp = self.ticks;
		self.cp.log_tail = self.log.log_tail;
		self.cp.cur_seg = self.log.cur_seg;
		self.cp.seg_offset = self.log.log_tail - self.superblock.seg_first(self.log.cur_seg);
		self.cp.valid = 1;

		let bno = if self.cp_slot {
			self.superblock.checkpoint1
		} else {
			self.superblock.checkpoint0
		};

		let pos = blk_pos(bno);
		self.file.encode_at(pos, &self.cp)?;
		self.file.fill(0u8, BSIZE - CHECKPOINT_BODY_SIZE - 4)?;
		self.file.encode(&self.cp.timestamp)?;

		log::debug!(
			"checkpoint -> block {bno}, timestamp {}, log_tail {}",
			self.cp.timestamp,
			self.cp.log_tail
		);
		self.cp_slot = !self.cp_slot;
		Ok(())
	}
}
