use std::io::{Error as IoError, Result as IoResult};

use super::{EngineState, Lfs};
use crate::{blockdev::Backend, data::*, err};

/// Staging area for modified inodes. Up to [`IPB`] dinodes accumulate in
/// the active buffer and land in a single inode block when flushed; the
/// flushing buffer holds the batch being written out.
pub(crate) struct DirtyInodes {
	pub(crate) active:   Vec<(u32, Dinode)>,
	pub(crate) flushing: Vec<(u32, Dinode)>,
}

impl DirtyInodes {
	pub fn new() -> Self {
		Self {
			active:   Vec::with_capacity(IPB),
			flushing: Vec::new(),
		}
	}

	/// Latest buffered copy of `inum`, active buffer first.
	pub fn lookup(&self, inum: u32) -> Option<Dinode> {
		self.active
			.iter()
			.chain(self.flushing.iter())
			.find(|(i, _)| *i == inum)
			.map(|(_, d)| *d)
	}

	pub fn remove(&mut self, inum: u32) {
		self.active.retain(|(i, _)| *i != inum);
	}

	pub fn is_empty(&self) -> bool {
		self.active.is_empty() && self.flushing.is_empty()
	}
}

impl<R: Backend> Lfs<R> {
	/// Allocate an inode of the given type. The new inode only exists in
	/// the dirty buffer until the next flush; its imap entry holds a
	/// placeholder meanwhile.
	#[doc(alias = "ialloc")]
	pub fn inode_alloc(&mut self, kind: InodeType) -> IoResult<u32> {
		self.assert_rw()?;
		self.maybe_clean()?;
		self.enter(EngineState::Serving)?;
		let r = self.do_inode_alloc(kind);
		self.leave();
		let inum = r?;
		self.sync_if_full()?;
		Ok(inum)
	}

	pub(crate) fn do_inode_alloc(&mut self, kind: InodeType) -> IoResult<u32> {
		let Some(inum) = self.imap.first_free() else {
			log::error!("inode_alloc: no inodes");
			return Err(err!(ENOSPC));
		};
		self.imap.set(inum, ImapSlot::Staged);
		self.stage_inode(inum, &Dinode::new(kind))?;
		log::trace!("inode_alloc({kind:?}) = {inum}");
		Ok(inum)
	}

	/// Read an inode, preferring the in-memory buffers over the on-disk
	/// copy the imap points at.
	#[doc(alias = "ilock")]
	pub fn read_inode(&mut self, inum: u32) -> IoResult<Dinode> {
		log::trace!("read_inode({inum});");
		if let Some(din) = self.dirty.lookup(inum) {
			return Ok(din);
		}

		match self.imap.get(inum) {
			ImapSlot::Free => Err(err!(ENOENT)),
			ImapSlot::Staged => {
				log::error!("read_inode({inum}): staged but not buffered");
				Err(err!(EIO))
			}
			ImapSlot::Located(loc) => {
				let din = self.read_dinode_at(loc)?;
				if !din.is_allocated() {
					log::error!("read_inode({inum}): no type at {loc:?}");
					return Err(err!(EIO));
				}
				Ok(din)
			}
		}
	}

	pub(crate) fn read_dinode_at(&mut self, loc: InodeLoc) -> IoResult<Dinode> {
		if loc.block >= self.superblock.size || loc.slot as usize >= IPB {
			log::error!("corrupt imap entry: {loc:?}");
			return Err(err!(EIO));
		}
		let pos = self.block_pos(loc.block) + loc.slot as u64 * DINODE_SIZE as u64;
		self.file.decode_at(pos)
	}

	/// Metadata about an inode.
	#[doc(alias("stat", "getattr"))]
	pub fn inode_attr(&mut self, inum: u32) -> IoResult<InodeAttr> {
		let din = self.read_inode(inum)?;
		let kind = din.kind().ok_or_else(|| err!(EIO))?;
		Ok(InodeAttr {
			inum,
			kind,
			nlink: din.nlink as u16,
			size: din.size,
		})
	}

	/// Stage a modified inode into the dirty buffer.
	#[doc(alias = "iupdate")]
	pub fn inode_update(&mut self, inum: u32, din: &Dinode) -> IoResult<()> {
		self.assert_rw()?;
		self.stage_inode(inum, din)?;
		self.sync_if_full()
	}

	pub(crate) fn stage_inode(&mut self, inum: u32, din: &Dinode) -> IoResult<()> {
		if let Some(slot) = self.dirty.active.iter_mut().find(|(i, _)| *i == inum) {
			slot.1 = *din;
			return Ok(());
		}
		if self.dirty.active.len() >= IPB {
			self.flush_inodes()?;
		}
		self.dirty.active.push((inum, *din));
		Ok(())
	}

	/// Full sync once the dirty buffer has filled up, unless a sync or the
	/// cleaner is already on the stack; those flush inodes on their own.
	pub(crate) fn sync_if_full(&mut self) -> IoResult<()> {
		if self.dirty.active.len() >= IPB && self.state == EngineState::Idle {
			self.sync()
		} else {
			Ok(())
		}
	}

	/// Write the active buffer out as one inode block and point the imap
	/// at the new copies. Inode versions survive the move; staged inodes
	/// get version 0.
	pub(crate) fn flush_inodes(&mut self) -> IoResult<()> {
		if self.dirty.active.is_empty() {
			return Ok(());
		}
		debug_assert!(self.dirty.flushing.is_empty());
		self.dirty.flushing = std::mem::take(&mut self.dirty.active);
		let batch = self.dirty.flushing.clone();

		// one INODE summary entry covers the whole block
		let bno = self.log_alloc(Some(SsbEntry::inode(batch[0].0)))?;

		let mut buf = [0u8; BSIZE];
		for (slot, (_, din)) in batch.iter().enumerate() {
			encode_into(din, &mut buf[slot * DINODE_SIZE..(slot + 1) * DINODE_SIZE])?;
		}
		self.write_block(bno, &buf)?;

		let mut old_blocks = Vec::new();
		for (slot, (inum, _)) in batch.iter().enumerate() {
			let version = match self.imap.get(*inum) {
				ImapSlot::Located(loc) => {
					old_blocks.push(loc.block);
					loc.version
				}
				ImapSlot::Staged => 0,
				ImapSlot::Free => {
					// freed while buffered; nothing to point at
					log::warn!("flush_inodes: inum {inum} freed while dirty");
					continue;
				}
			};
			self.imap.set(
				*inum,
				ImapSlot::Located(InodeLoc {
					block: bno,
					slot: slot as u8,
					version,
				}),
			);
		}

		// superseded inode blocks die once nothing points at them
		old_blocks.sort_unstable();
		old_blocks.dedup();
		for old in old_blocks {
			self.release_inode_block(old);
		}

		self.dirty.flushing.clear();
		log::debug!("flush_inodes: {} inodes -> block {bno}", batch.len());
		Ok(())
	}

	/// Drop an inode block's live contribution once the imap no longer
	/// references it.
	pub(crate) fn release_inode_block(&mut self, block: u32) {
		if !self.imap.iter_located().any(|(_, loc)| loc.block == block) {
			self.update_usage(block, -(BSIZE as i32));
		}
	}

	/// Discard the inode's contents. Every released block is charged
	/// against its segment and the imap version is bumped so the cleaner
	/// rejects summary entries for the released blocks.
	#[doc(alias = "itrunc")]
	pub fn inode_truncate(&mut self, inum: u32) -> IoResult<()> {
		self.assert_rw()?;
		self.enter(EngineState::Serving)?;
		let r = self.do_truncate(inum);
		self.leave();
		r?;
		self.sync_if_full()
	}

	pub(crate) fn do_truncate(&mut self, inum: u32) -> IoResult<()> {
		log::trace!("inode_truncate({inum});");
		let mut din = self.read_inode(inum)?;

		for i in 0..NDIRECT {
			if din.addrs[i] != 0 {
				self.update_usage(din.addrs[i], -(BSIZE as i32));
				din.addrs[i] = 0;
			}
		}
		if din.addrs[NDIRECT] != 0 {
			let ind = din.addrs[NDIRECT];
			let addrs = self.read_indirect(ind)?;
			for a in addrs.iter().filter(|a| **a != 0) {
				self.update_usage(*a, -(BSIZE as i32));
			}
			self.update_usage(ind, -(BSIZE as i32));
			din.addrs[NDIRECT] = 0;
		}
		din.size = 0;

		if let ImapSlot::Located(mut loc) = self.imap.get(inum) {
			loc.version = loc.version.wrapping_add(1);
			self.imap.set(inum, ImapSlot::Located(loc));
		}

		self.stage_inode(inum, &din)
	}

	/// Drop an inode that has no more links: truncate it, forget any
	/// buffered copy, free the imap slot and persist the freed state.
	#[doc(alias = "iput")]
	pub fn inode_put(&mut self, inum: u32) -> IoResult<()> {
		let din = self.read_inode(inum)?;
		if din.nlink != 0 {
			return Ok(());
		}
		self.assert_rw()?;
		log::trace!("inode_put({inum}): freeing");

		self.enter(EngineState::Serving)?;
		let r = self.do_truncate(inum);
		self.leave();
		r?;

		self.dirty.remove(inum);
		let old = self.imap.get(inum).located();
		self.imap.set(inum, ImapSlot::Free);
		if let Some(loc) = old {
			self.release_inode_block(loc.block);
		}
		self.sync()
	}

	/// Version the cleaner compares summary entries against.
	pub(crate) fn inode_version(&self, inum: u32) -> u8 {
		match self.imap.get(inum) {
			ImapSlot::Located(loc) => loc.version,
			_ => 0,
		}
	}
}
