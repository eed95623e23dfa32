use crate::data::{ImapSlot, InodeLoc, IMAP_PER_BLOCK};

/// In-memory inode map: inode number → location of the latest on-disk
/// copy. Persisted as a run of imap blocks whose addresses live in the
/// checkpoint.
pub(crate) struct Imap {
	slots: Vec<ImapSlot>,
	dirty: bool,
}

impl Imap {
	pub fn new(ninodes: u32) -> Self {
		Self {
			slots: vec![ImapSlot::Free; ninodes as usize],
			dirty: false,
		}
	}

	/// Rebuild from the raw words of the persisted imap blocks.
	pub fn from_raw(raw: &[u32], ninodes: u32) -> Self {
		let mut slots = vec![ImapSlot::Free; ninodes as usize];
		for (i, slot) in slots.iter_mut().enumerate() {
			if let Some(&w) = raw.get(i) {
				*slot = ImapSlot::from_raw(w);
			}
		}
		Self {
			slots,
			dirty: false,
		}
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn get(&self, inum: u32) -> ImapSlot {
		assert!(
			inum != 0 && (inum as usize) < self.slots.len(),
			"invalid inum {inum}"
		);
		self.slots[inum as usize]
	}

	pub fn set(&mut self, inum: u32, slot: ImapSlot) {
		assert!(
			inum != 0 && (inum as usize) < self.slots.len(),
			"invalid inum {inum}"
		);
		self.slots[inum as usize] = slot;
		self.dirty = true;
	}

	/// Lowest unused inode number, skipping the reserved inum 0.
	pub fn first_free(&self) -> Option<u32> {
		(1..self.slots.len() as u32).find(|&i| self.slots[i as usize] == ImapSlot::Free)
	}

	pub fn free_count(&self) -> usize {
		self.slots[1..]
			.iter()
			.filter(|s| **s == ImapSlot::Free)
			.count()
	}

	/// All inodes with an on-disk copy.
	pub fn iter_located(&self) -> impl Iterator<Item = (u32, InodeLoc)> + '_ {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(i, s)| s.located().map(|loc| (i as u32, loc)))
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn mark_dirty(&mut self) {
		self.dirty = true;
	}

	pub fn clear_dirty(&mut self) {
		self.dirty = false;
	}

	/// Number of blocks the map occupies on disk.
	pub fn nblocks(&self) -> usize {
		self.slots.len().div_ceil(IMAP_PER_BLOCK)
	}

	/// Raw words of the `i`th imap block.
	pub fn raw_block(&self, i: usize) -> [u32; IMAP_PER_BLOCK] {
		let mut out = [0u32; IMAP_PER_BLOCK];
		for (j, w) in out.iter_mut().enumerate() {
			if let Some(s) = self.slots.get(i * IMAP_PER_BLOCK + j) {
				*w = s.to_raw();
			}
		}
		out
	}
}
