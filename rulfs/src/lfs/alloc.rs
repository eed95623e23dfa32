use std::{
	collections::VecDeque,
	io::{Error as IoError, Result as IoResult},
};

use super::Lfs;
use crate::{blockdev::Backend, data::*, err};

/// Allocator state: the log tail, the segment it points into, the virgin
/// frontier, and the ring of segments the cleaner has emptied.
pub(crate) struct LogState {
	/// Next block to hand out.
	pub log_tail: u32,
	/// Segment being appended to.
	pub cur_seg:  u32,
	/// First never-used segment; everything from here up is sequential
	/// free space.
	pub next_seq: u32,

	/// Reclaimed segments available for reuse.
	pub free_ring: VecDeque<u32>,

	/// Summary entries for blocks allocated in the current segment,
	/// pending flush.
	pub ssb: Vec<SsbEntry>,

	/// Set when a cleaner run reclaimed nothing; cleared by any
	/// deletion-driven usage drop.
	pub gc_failed: bool,
}

impl LogState {
	/// Derive the allocator state from a committed checkpoint. The virgin
	/// frontier sits one past the highest in-use segment; free segments
	/// below it (other than the current one) were emptied by the cleaner
	/// and seed the ring.
	pub fn rebuild(sb: &Superblock, cp: &Checkpoint, sut: &super::UsageTable) -> Self {
		let mut next_seq = cp.cur_seg + 1;
		for s in 0..sb.nsegs {
			if !sut.is_free(s) {
				next_seq = next_seq.max(s + 1);
			}
		}
		let free_ring = (0..sb.nsegs)
			.filter(|&s| sut.is_free(s) && s < next_seq && s != cp.cur_seg)
			.collect();

		Self {
			log_tail: cp.log_tail,
			cur_seg: cp.cur_seg,
			next_seq,
			free_ring,
			ssb: Vec::new(),
			gc_failed: false,
		}
	}

	/// Allocator state of a freshly formatted image: segment 0 is current,
	/// everything else is virgin.
	pub fn fresh(sb: &Superblock) -> Self {
		Self {
			log_tail:  sb.segstart,
			cur_seg:   0,
			next_seq:  1,
			free_ring: VecDeque::new(),
			ssb:       Vec::new(),
			gc_failed: false,
		}
	}

	pub fn free_count(&self, nsegs: u32) -> usize {
		self.free_ring.len() + (nsegs - self.next_seq) as usize
	}
}

impl<R: Backend> Lfs<R> {
	pub(crate) fn free_segment_count(&self) -> usize {
		self.log.free_count(self.superblock.nsegs)
	}

	/// Hand out the next log block. When `summary` is given, the matching
	/// summary entry is queued in the same step, so a block on disk is
	/// never without provenance in its segment, and the segment's live
	/// count grows by one block.
	///
	/// Data and indirect blocks are kept out of the last two blocks of a
	/// segment; those are reserved for an inode block and the segment
	/// summary.
	pub(crate) fn log_alloc(&mut self, summary: Option<SsbEntry>) -> IoResult<u32> {
		let segsize = self.superblock.segsize;
		let limit = match &summary {
			Some(e) if e.kind == SSB_DATA || e.kind == SSB_INDIRECT => segsize - 2,
			_ => segsize - 1,
		};

		loop {
			let off = self.log.log_tail - self.superblock.seg_first(self.log.cur_seg);
			if off < limit {
				let bno = self.log.log_tail;
				self.log.log_tail += 1;
				if let Some(e) = summary {
					self.log.ssb.push(e);
					assert!(self.log.ssb.len() <= SSB_ENTRIES_PER_BLOCK);
					self.update_usage(bno, BSIZE as i32);
				}
				log::trace!("log_alloc({:?}) = {bno}", summary.map(|e| e.kind));
				return Ok(bno);
			}
			self.seg_advance()?;
		}
	}

	/// Close the current segment and move the tail to a fresh one. The
	/// pending summary is written into the segment's reserved last block
	/// first, so a filled segment always ends in a valid SSB.
	fn seg_advance(&mut self) -> IoResult<()> {
		let sb = &self.superblock;
		let first = sb.seg_first(self.log.cur_seg);
		let end = first + sb.segsize;

		let next = self.pick_next_segment()?;
		if self.log.log_tail < end {
			self.write_ssb_block(end - 1, self.superblock.seg_first(next))?;
		} else {
			debug_assert!(self.log.ssb.is_empty());
		}

		log::debug!(
			"segment {} full, switching to {} ({} free left)",
			self.log.cur_seg,
			next,
			self.free_segment_count()
		);
		self.log.cur_seg = next;
		self.log.log_tail = self.superblock.seg_first(next);
		let age = self.ticks as u16;
		self.sut.mark_used(next, age);
		Ok(())
	}

	fn pick_next_segment(&mut self) -> IoResult<u32> {
		if self.log.next_seq < self.superblock.nsegs {
			let s = self.log.next_seq;
			self.log.next_seq += 1;
			return Ok(s);
		}
		if let Some(s) = self.log.free_ring.pop_front() {
			return Ok(s);
		}
		log::error!("log_alloc: out of segments");
		Err(err!(ENOSPC))
	}

	/// Flush the pending summary entries to a block at the log tail.
	/// Called by sync, and by the cleaner before it frees a victim so that
	/// relocated blocks are summarized in their destination segments.
	pub(crate) fn flush_ssb(&mut self) -> IoResult<()> {
		if self.log.ssb.is_empty() {
			return Ok(());
		}
		// Entries imply allocations in the current segment, which cannot
		// have filled it completely.
		let end = self.superblock.seg_first(self.log.cur_seg) + self.superblock.segsize;
		assert!(self.log.log_tail < end);

		let bno = self.log.log_tail;
		self.log.log_tail += 1;
		self.write_ssb_block(bno, 0)
	}

	fn write_ssb_block(&mut self, bno: u32, next_hint: u32) -> IoResult<()> {
		let entries = std::mem::take(&mut self.log.ssb);
		let hdr = SsbHeader {
			magic:         SSB_MAGIC,
			nblocks:       entries.len() as u32,
			checksum:      ssb_checksum(&entries),
			timestamp:     self.ticks,
			next_seg_addr: next_hint,
		};
		log::trace!("write_ssb_block({bno}): {} entries", entries.len());

		let pos = self.block_pos(bno);
		self.file.encode_at(pos, &hdr)?;
		for e in &entries {
			self.file.encode(e)?;
		}
		let used = SSB_HDR_SIZE + entries.len() * SSB_ENTRY_SIZE;
		self.file.fill(0u8, BSIZE - used)?;
		Ok(())
	}
}
