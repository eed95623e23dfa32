use std::{collections::HashSet, io::Result as IoResult};

use super::{EngineState, Lfs};
use crate::{blockdev::Backend, data::*};

/// Outcome of sweeping one summary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sweep {
	/// Entry is dead or already elsewhere; nothing to do.
	Continue,
	/// The block was moved to the log tail.
	Relocated,
	/// Entry refers to something that no longer parses; skipped.
	InvalidSkip,
	/// The log filled up mid-relocation; the victim must be left as is.
	OutOfSpaceAbort,
}

impl<R: Backend> Lfs<R> {
	pub(crate) fn disk_usage_pct(&self) -> u32 {
		let nsegs = self.superblock.nsegs;
		let used = nsegs as usize - self.free_segment_count();
		(used as u32 * 100) / nsegs
	}

	/// Cleaner trigger, checked on the way into mutating operations: run
	/// once the free-segment pool falls under the target and the disk is
	/// either wrapped or filling up. A failed run latches off until a
	/// deletion frees something.
	pub(crate) fn maybe_clean(&mut self) -> IoResult<()> {
		if self.state != EngineState::Idle || !self.write_enabled() {
			return Ok(());
		}
		let free = self.free_segment_count();
		if free >= GC_TARGET_SEGS {
			return Ok(());
		}
		let seq_exhausted = self.log.next_seq >= self.superblock.nsegs;
		if free > 0 && !seq_exhausted && self.disk_usage_pct() < GC_THRESHOLD {
			return Ok(());
		}
		if self.log.gc_failed {
			return Ok(());
		}
		self.clean()
	}

	/// Run the cleaner: pick low-utility victims by cost-benefit score,
	/// relocate their live blocks to the log tail, and return emptied
	/// segments to the free ring. Finishes with a sync so the relocated
	/// tree is durable before any reclaimed segment can be reused.
	pub fn clean(&mut self) -> IoResult<()> {
		self.assert_rw()?;
		if self.state != EngineState::Idle {
			return Ok(());
		}
		self.state = EngineState::Cleaning;
		self.ticks = self.ticks.wrapping_add(1);
		let r = self.do_clean();
		self.state = EngineState::Idle;
		let freed = r?;

		// Reclaimed segments become reusable only once the checkpoint that
		// records their relocated copies is durable; handing them out
		// earlier could overwrite blocks the on-disk checkpoint still
		// references.
		self.sync()?;
		self.log.free_ring.extend(freed);
		Ok(())
	}

	fn do_clean(&mut self) -> IoResult<Vec<u32>> {
		let victims = self.select_victims();
		if victims.is_empty() {
			log::info!("cleaner: no candidates");
			self.log.gc_failed = true;
			return Ok(Vec::new());
		}
		log::info!(
			"cleaner: starting, {} candidates, {} segments free",
			victims.len(),
			self.free_segment_count()
		);

		let mut freed = Vec::new();
		for v in victims {
			let live = self.sut.get(v).live;
			if self.clean_victim(v)? {
				// cover the relocated blocks in their destination
				// segments before the victim is handed out again
				self.flush_ssb()?;
				self.sut.set_free(v);
				// the committed imap or SUT may still live here; force the
				// sync below to move them
				let n = self.cp.imap_nblocks as usize;
				if self.cp.imap_addrs[..n.min(NIMAP_BLOCKS)]
					.iter()
					.any(|&b| self.superblock.in_seg(b, v))
				{
					self.imap.mark_dirty();
				}
				for i in 0..(self.cp.sut_nblocks as usize).min(NSUT_BLOCKS) {
					if self.superblock.in_seg(self.cp.sut_addrs[i], v) {
						self.cp.sut_addrs[i] = 0;
					}
				}
				freed.push(v);
				log::info!("cleaner: segment {v} reclaimed ({live} live bytes moved)");
			} else {
				self.log.gc_failed = true;
				log::warn!("cleaner: out of space, leaving segment {v} in place");
				break;
			}
		}
		if freed.is_empty() {
			self.log.gc_failed = true;
		}
		log::info!(
			"cleaner: done, {} segments reclaimed",
			freed.len()
		);
		Ok(freed)
	}

	/// Cost-benefit victim selection over all non-free, non-current
	/// segments: `(100 − u) · age · 1000 / (100 + u)`, best first. Falls
	/// back to any non-full segment when nothing scores.
	fn select_victims(&self) -> Vec<u32> {
		let sb = &self.superblock;
		let seg_bytes = sb.segsize * BSIZE as u32;

		let mut scored: Vec<(u64, u32)> = Vec::new();
		for s in 0..sb.nsegs {
			if s == self.log.cur_seg || self.sut.is_free(s) {
				continue;
			}
			let u = self.sut.utilization_pct(s, seg_bytes).min(100);
			if u > GC_UTIL_THRESHOLD {
				continue;
			}
			let age = (self.ticks as u16).wrapping_sub(self.sut.get(s).age) as u64;
			let score = (100 - u) as u64 * age * 1000 / (100 + u) as u64;
			if score == 0 {
				continue;
			}
			scored.push((score, s));
		}
		scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
		scored.truncate(GC_TARGET_SEGS);

		if scored.is_empty() {
			// desperation: take anything not completely full
			for s in 0..sb.nsegs {
				if s == self.log.cur_seg || self.sut.is_free(s) {
					continue;
				}
				if self.sut.utilization_pct(s, seg_bytes) < 100 {
					log::warn!("cleaner: desperation pick of segment {s}");
					return vec![s];
				}
			}
		}
		scored.into_iter().map(|(_, s)| s).collect()
	}

	/// Relocate everything still live out of segment `v`. Returns false if
	/// the victim must be left in place (log filled up mid-move).
	fn clean_victim(&mut self, v: u32) -> IoResult<bool> {
		let first = self.superblock.seg_first(v);
		let segsize = self.superblock.segsize;

		// every block whose magic and checksum hold is a summary
		let mut entries = Vec::new();
		let mut any_ssb = false;
		let mut buf = [0u8; BSIZE];
		for off in 0..segsize {
			self.read_block(first + off, &mut buf)?;
			if let Some((_, es)) = parse_ssb(&buf) {
				any_ssb = true;
				entries.extend(es);
			}
		}
		if !any_ssb {
			// format-time segment; walk the imap instead
			log::warn!("cleaner: segment {v} has no summary, scanning imap");
			return self.sweep_fallback(v);
		}

		let mut seen = HashSet::new();
		let mut inode_scan_done = false;
		for e in entries {
			let outcome = match e.kind {
				SSB_INODE => {
					if inode_scan_done {
						continue;
					}
					inode_scan_done = true;
					self.relocate_inode_blocks(v, &mut seen)?
				}
				SSB_DATA => self.relocate_data(v, e.inum as u32, e.offset, e.version)?,
				SSB_INDIRECT => self.relocate_indirect(v, e.inum as u32, e.version)?,
				kind => {
					log::warn!("cleaner: unknown summary kind {kind} in segment {v}");
					Sweep::InvalidSkip
				}
			};
			if outcome == Sweep::OutOfSpaceAbort {
				return Ok(false);
			}
		}
		Ok(true)
	}

	fn gc_alloc(&mut self, e: SsbEntry) -> IoResult<Option<u32>> {
		match self.log_alloc(Some(e)) {
			Ok(b) => Ok(Some(b)),
			Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => Ok(None),
			Err(err) => Err(err),
		}
	}

	fn copy_block(&mut self, from: u32, to: u32) -> IoResult<()> {
		let mut buf = [0u8; BSIZE];
		self.read_block(from, &mut buf)?;
		self.write_block(to, &buf)
	}

	/// Move every inode block the imap still points into `v`. One pass
	/// covers all INODE summary entries of the victim; `seen` keeps a
	/// block from moving twice.
	fn relocate_inode_blocks(&mut self, v: u32, seen: &mut HashSet<u32>) -> IoResult<Sweep> {
		let targets: Vec<u32> = self
			.imap
			.iter_located()
			.filter(|(_, loc)| self.superblock.in_seg(loc.block, v))
			.map(|(_, loc)| loc.block)
			.collect();

		let mut moved = false;
		for old in targets {
			if !seen.insert(old) {
				continue;
			}
			let residents: Vec<(u32, InodeLoc)> = self
				.imap
				.iter_located()
				.filter(|(_, loc)| loc.block == old)
				.collect();
			debug_assert!(!residents.is_empty());

			let Some(new) = self.gc_alloc(SsbEntry::inode(residents[0].0))? else {
				return Ok(Sweep::OutOfSpaceAbort);
			};
			self.copy_block(old, new)?;

			for (inum, loc) in residents {
				self.imap.set(
					inum,
					ImapSlot::Located(InodeLoc {
						block: new,
						..loc
					}),
				);
			}
			self.update_usage(old, -(BSIZE as i32));
			log::trace!("cleaner: inode block {old} -> {new}");
			moved = true;
		}

		Ok(if moved {
			Sweep::Relocated
		} else {
			Sweep::Continue
		})
	}

	/// Move one data block if the summary entry still names the live copy:
	/// the version must match the imap and the inode's current pointer
	/// must fall inside the victim.
	fn relocate_data(&mut self, v: u32, inum: u32, bn: u32, version: u8) -> IoResult<Sweep> {
		if inum == 0 || inum as usize >= self.imap.len() || bn as usize >= MAXFILE {
			return Ok(Sweep::InvalidSkip);
		}
		let cur_version = match self.imap.get(inum) {
			ImapSlot::Located(loc) => loc.version,
			ImapSlot::Staged => 0,
			ImapSlot::Free => return Ok(Sweep::Continue),
		};
		if cur_version != version {
			return Ok(Sweep::Continue);
		}

		let Ok(din) = self.read_inode(inum) else {
			return Ok(Sweep::InvalidSkip);
		};
		let addr = self.resolve_addr(&din, bn as usize)?;
		if addr == 0 || !self.superblock.in_seg(addr, v) {
			return Ok(Sweep::Continue);
		}

		let Some(new) = self.gc_alloc(SsbEntry::data(inum, bn, version))? else {
			return Ok(Sweep::OutOfSpaceAbort);
		};
		self.copy_block(addr, new)?;

		let mut din = self.read_inode(inum)?;
		match self.set_block_addr(inum, &mut din, bn as usize, new, version) {
			Ok(()) => {}
			Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => {
				// the copy stays unreferenced; its summary entry will
				// read as dead
				self.update_usage(new, -(BSIZE as i32));
				return Ok(Sweep::OutOfSpaceAbort);
			}
			Err(err) => return Err(err),
		}
		self.update_usage(addr, -(BSIZE as i32));
		self.stage_inode(inum, &din)?;
		log::trace!("cleaner: data {inum}/{bn} {addr} -> {new}");
		Ok(Sweep::Relocated)
	}

	/// Move the inode's indirect block if its live copy sits in `v`.
	fn relocate_indirect(&mut self, v: u32, inum: u32, version: u8) -> IoResult<Sweep> {
		if inum == 0 || inum as usize >= self.imap.len() {
			return Ok(Sweep::InvalidSkip);
		}
		let cur_version = match self.imap.get(inum) {
			ImapSlot::Located(loc) => loc.version,
			ImapSlot::Staged => 0,
			ImapSlot::Free => return Ok(Sweep::Continue),
		};
		if cur_version != version {
			return Ok(Sweep::Continue);
		}

		let Ok(mut din) = self.read_inode(inum) else {
			return Ok(Sweep::InvalidSkip);
		};
		let old = din.addrs[NDIRECT];
		if old == 0 || !self.superblock.in_seg(old, v) {
			return Ok(Sweep::Continue);
		}

		let Some(new) = self.gc_alloc(SsbEntry::indirect(inum, version))? else {
			return Ok(Sweep::OutOfSpaceAbort);
		};
		self.copy_block(old, new)?;
		din.addrs[NDIRECT] = new;
		self.update_usage(old, -(BSIZE as i32));
		self.stage_inode(inum, &din)?;
		log::trace!("cleaner: indirect {inum} {old} -> {new}");
		Ok(Sweep::Relocated)
	}

	/// Liveness sweep for a segment without summaries: relocate every
	/// imap-reachable inode, data and indirect block that falls inside
	/// `v`. Bounded by inodes times the largest file.
	fn sweep_fallback(&mut self, v: u32) -> IoResult<bool> {
		let mut seen = HashSet::new();
		if self.relocate_inode_blocks(v, &mut seen)? == Sweep::OutOfSpaceAbort {
			return Ok(false);
		}

		let mut inums: Vec<u32> = self.imap.iter_located().map(|(i, _)| i).collect();
		inums.extend(self.dirty.active.iter().map(|(i, _)| *i));
		inums.sort_unstable();
		inums.dedup();

		for inum in inums {
			let version = self.inode_version(inum);
			let Ok(din) = self.read_inode(inum) else {
				continue;
			};

			for bn in 0..NDIRECT {
				if self.relocate_data(v, inum, bn as u32, version)? == Sweep::OutOfSpaceAbort {
					return Ok(false);
				}
			}
			if din.addrs[NDIRECT] != 0 {
				if self.relocate_indirect(v, inum, version)? == Sweep::OutOfSpaceAbort {
					return Ok(false);
				}
				for bn in NDIRECT..MAXFILE {
					if self.relocate_data(v, inum, bn as u32, version)? == Sweep::OutOfSpaceAbort {
						return Ok(false);
					}
				}
			}
		}
		Ok(true)
	}
}
