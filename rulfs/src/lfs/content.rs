use std::io::{Error as IoError, Result as IoResult};

use super::{EngineState, Lfs};
use crate::{blockdev::Backend, data::*, err};

impl<R: Backend> Lfs<R> {
	/// Disk address of the inode's `bn`th logical block; 0 for a hole.
	pub(crate) fn resolve_addr(&mut self, din: &Dinode, bn: usize) -> IoResult<u32> {
		if bn < NDIRECT {
			return Ok(din.addrs[bn]);
		}
		let idx = bn - NDIRECT;
		if idx >= NINDIRECT {
			return Err(err!(EINVAL));
		}
		let ind = din.addrs[NDIRECT];
		if ind == 0 {
			return Ok(0);
		}
		let addrs = self.read_indirect(ind)?;
		Ok(addrs[idx])
	}

	pub(crate) fn read_indirect(&mut self, bno: u32) -> IoResult<[u32; NINDIRECT]> {
		debug_assert!(bno >= self.superblock.segstart);
		self.file.decode_at(self.block_pos(bno))
	}

	pub(crate) fn write_indirect(&mut self, bno: u32, addrs: &[u32; NINDIRECT]) -> IoResult<()> {
		self.file.encode_at(self.block_pos(bno), addrs)
	}

	/// Point logical block `bn` of the inode at `new`. An indirect slot
	/// copies the indirect block on write, with its own summary entry, and
	/// releases the old copy.
	pub(crate) fn set_block_addr(
		&mut self,
		inum: u32,
		din: &mut Dinode,
		bn: usize,
		new: u32,
		version: u8,
	) -> IoResult<()> {
		if bn < NDIRECT {
			din.addrs[bn] = new;
			return Ok(());
		}
		let idx = bn - NDIRECT;
		assert!(idx < NINDIRECT, "set_block_addr: bn {bn} out of range");

		let old_ind = din.addrs[NDIRECT];
		let new_ind = self.log_alloc(Some(SsbEntry::indirect(inum, version)))?;
		let mut addrs = if old_ind != 0 {
			self.read_indirect(old_ind)?
		} else {
			[0u32; NINDIRECT]
		};
		addrs[idx] = new;
		self.write_indirect(new_ind, &addrs)?;
		din.addrs[NDIRECT] = new_ind;
		if old_ind != 0 {
			self.update_usage(old_ind, -(BSIZE as i32));
		}
		Ok(())
	}

	/// Disk block backing the `bn`th block of inode `inum`, allocated and
	/// zero-filled on demand.
	pub fn bmap(&mut self, inum: u32, bn: u32) -> IoResult<u32> {
		let din = self.read_inode(inum)?;
		let addr = self.resolve_addr(&din, bn as usize)?;
		if addr != 0 {
			return Ok(addr);
		}
		self.assert_rw()?;

		let version = self.inode_version(inum);
		let new = self.log_alloc(Some(SsbEntry::data(inum, bn, version)))?;
		self.write_block(new, &[0u8; BSIZE])?;

		let mut din = self.read_inode(inum)?;
		self.set_block_addr(inum, &mut din, bn as usize, new, version)?;
		self.stage_inode(inum, &din)?;
		log::trace!("bmap({inum}, {bn}) = {new} (fresh)");
		Ok(new)
	}

	/// Read data from an inode. Holes read as zeros.
	#[doc(alias = "readi")]
	pub fn inode_read(&mut self, inum: u32, offset: u32, buffer: &mut [u8]) -> IoResult<usize> {
		log::trace!("inode_read({inum}, {offset}, {})", buffer.len());
		let din = self.read_inode(inum)?;
		if din.kind() == Some(InodeType::Device) {
			return Err(err!(ENODEV));
		}
		if offset > din.size {
			return Err(err!(EINVAL));
		}

		let len = (buffer.len() as u64).min((din.size - offset) as u64) as u32;
		let end = offset + len;
		let mut off = offset;
		let mut boff = 0usize;
		let mut blockbuf = [0u8; BSIZE];

		while off < end {
			let bn = (off as usize) / BSIZE;
			let bo = (off as usize) % BSIZE;
			let num = (BSIZE - bo).min((end - off) as usize);

			match self.resolve_addr(&din, bn)? {
				0 => blockbuf.fill(0u8),
				addr => self.read_block(addr, &mut blockbuf)?,
			}
			buffer[boff..boff + num].copy_from_slice(&blockbuf[bo..bo + num]);

			off += num as u32;
			boff += num;
		}

		Ok(boff)
	}

	/// Write data to an inode. Every touched block is redirected to a
	/// fresh log block (read-modify-write for partial blocks), the old
	/// copy is charged off its segment, and the inode is staged.
	#[doc(alias = "writei")]
	pub fn inode_write(&mut self, inum: u32, offset: u32, buffer: &[u8]) -> IoResult<usize> {
		log::trace!("inode_write({inum}, {offset}, {})", buffer.len());
		self.assert_rw()?;
		self.maybe_clean()?;
		self.enter(EngineState::Serving)?;
		let r = self.do_inode_write(inum, offset, buffer);
		self.leave();
		let n = r?;
		self.sync_if_full()?;
		Ok(n)
	}

	pub(crate) fn do_inode_write(
		&mut self,
		inum: u32,
		offset: u32,
		buffer: &[u8],
	) -> IoResult<usize> {
		let mut din = self.read_inode(inum)?;
		if din.kind() == Some(InodeType::Device) {
			return Err(err!(ENODEV));
		}
		if offset > din.size {
			return Err(err!(EINVAL));
		}
		if offset as u64 + buffer.len() as u64 > (MAXFILE * BSIZE) as u64 {
			return Err(err!(EFBIG));
		}

		let version = self.inode_version(inum);
		let end = offset + buffer.len() as u32;
		let mut off = offset;
		let mut boff = 0usize;
		let mut blockbuf = [0u8; BSIZE];

		while off < end {
			let bn = (off as usize) / BSIZE;
			let bo = (off as usize) % BSIZE;
			let num = (BSIZE - bo).min((end - off) as usize);

			let old = self.resolve_addr(&din, bn)?;
			let new = self.log_alloc(Some(SsbEntry::data(inum, bn as u32, version)))?;

			if num < BSIZE && old != 0 {
				self.read_block(old, &mut blockbuf)?;
			} else {
				blockbuf.fill(0u8);
			}
			blockbuf[bo..bo + num].copy_from_slice(&buffer[boff..boff + num]);
			self.write_block(new, &blockbuf)?;

			self.set_block_addr(inum, &mut din, bn, new, version)?;
			if old != 0 {
				self.update_usage(old, -(BSIZE as i32));
			}

			off += num as u32;
			boff += num;
		}

		if end > din.size {
			din.size = end;
		}
		self.stage_inode(inum, &din)?;

		Ok(boff)
	}
}
