use bincode::{Decode, Encode};

/// Root directory i-number.
pub const ROOTINO: u32 = 1;

/// Block size in bytes.
pub const BSIZE: usize = 512;

/// Superblock magic number ("LFS!").
pub const LFS_MAGIC: u32 = 0x4C46_5321;

/// Segment summary block magic number ("SSB!").
pub const SSB_MAGIC: u32 = 0x5353_4221;

/// Block number of the superblock.
pub const SBLOCK: u32 = 1;

/// Direct block addresses per inode.
pub const NDIRECT: usize = 12;

/// Block addresses per indirect block.
pub const NINDIRECT: usize = BSIZE / 4;

/// Largest file size, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Size of an on-disk inode.
pub const DINODE_SIZE: usize = 64;

/// Inodes per inode block.
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// Maximum length of a file name.
pub const DIRSIZ: usize = 14;

/// Maximum number of imap blocks referenced by a checkpoint.
pub const NIMAP_BLOCKS: usize = 4;

/// Maximum number of segment usage table blocks referenced by a checkpoint.
pub const NSUT_BLOCKS: usize = 8;

/// Imap entries per imap block.
pub const IMAP_PER_BLOCK: usize = BSIZE / 4;

/// Usage table entries per SUT block.
pub const SUT_PER_BLOCK: usize = BSIZE / 4;

/// Size of the on-disk segment summary header.
pub const SSB_HDR_SIZE: usize = 20;

/// Size of one segment summary entry.
pub const SSB_ENTRY_SIZE: usize = 8;

/// Summary entries that fit in one block after the header.
pub const SSB_ENTRIES_PER_BLOCK: usize = (BSIZE - SSB_HDR_SIZE) / SSB_ENTRY_SIZE;

/// Disk usage percentage above which the cleaner is triggered.
pub const GC_THRESHOLD: u32 = 30;

/// Number of segments the cleaner tries to reclaim per run; also the
/// free-segment watermark that triggers it.
pub const GC_TARGET_SEGS: usize = 8;

/// Segments above this utilization percentage are never worth cleaning.
pub const GC_UTIL_THRESHOLD: u32 = 95;

/// Bits of the imap entry encoding taken by the inode-block slot index.
pub const IMAP_SLOT_BITS: u32 = 4;

/// Bits of the imap entry encoding taken by the inode version.
pub const IMAP_VERSION_BITS: u32 = 8;

/// Free-segment marker in the usage table's `live` field.
pub const SUT_FREE: u16 = 0xFFFF;

/// Disk layout:
/// `[ boot | superblock | checkpoint0 | checkpoint1 | segment 0 | segment 1 | .. ]`
///
/// Immutable after format.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Superblock {
	/// Must be [`LFS_MAGIC`].
	pub magic: u32,

	/// Size of the file system image in blocks.
	pub size: u32,

	/// Number of segments.
	pub nsegs: u32,

	/// Segment size in blocks.
	pub segsize: u32,

	/// Block number of the first segment.
	pub segstart: u32,

	/// Maximum number of inodes.
	pub ninodes: u32,

	/// Block number of checkpoint 0.
	pub checkpoint0: u32,

	/// Block number of checkpoint 1.
	pub checkpoint1: u32,
}

impl Superblock {
	/// First block of segment `seg`.
	pub fn seg_first(&self, seg: u32) -> u32 {
		self.segstart + seg * self.segsize
	}

	/// Segment containing block `bno`.
	pub fn seg_of(&self, bno: u32) -> u32 {
		debug_assert!(bno >= self.segstart);
		(bno - self.segstart) / self.segsize
	}

	/// Whether block `bno` lies inside segment `seg`.
	pub fn in_seg(&self, bno: u32, seg: u32) -> bool {
		bno >= self.seg_first(seg) && bno < self.seg_first(seg) + self.segsize
	}

	/// Number of imap blocks needed for `ninodes` entries.
	pub fn imap_nblocks(&self) -> usize {
		(self.ninodes as usize).div_ceil(IMAP_PER_BLOCK)
	}

	/// Number of usage table blocks needed for `nsegs` entries.
	pub fn sut_nblocks(&self) -> usize {
		(self.nsegs as usize).div_ceil(SUT_PER_BLOCK)
	}
}

/// Checkpoint body. The block carries `timestamp` again in its last four
/// bytes; a torn write is detected by the two copies disagreeing.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Checkpoint {
	pub timestamp:   u32,
	/// Next log append position.
	pub log_tail:    u32,
	pub cur_seg:     u32,
	pub seg_offset:  u32,
	pub imap_addrs:  [u32; NIMAP_BLOCKS],
	pub imap_nblocks: u32,
	pub sut_addrs:   [u32; NSUT_BLOCKS],
	pub sut_nblocks: u32,
	pub valid:       u32,
}

/// Encoded size of the checkpoint body; the footer timestamp sits in the
/// last four bytes of the block.
pub const CHECKPOINT_BODY_SIZE: usize = 76;

/// File type stored in a dinode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
	Directory,
	RegularFile,
	Device,
}

pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEV: i16 = 3;

impl InodeType {
	pub fn to_raw(self) -> i16 {
		match self {
			Self::Directory => T_DIR,
			Self::RegularFile => T_FILE,
			Self::Device => T_DEV,
		}
	}

	pub fn from_raw(ty: i16) -> Option<Self> {
		match ty {
			T_DIR => Some(Self::Directory),
			T_FILE => Some(Self::RegularFile),
			T_DEV => Some(Self::Device),
			_ => None,
		}
	}
}

/// On-disk inode. Inodes live in the log like everything else; the imap
/// tracks where the latest copy of each one is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Dinode {
	/// File type; 0 means the slot is unused.
	pub ty:    i16,
	/// Major device number (`T_DEV` only).
	pub major: i16,
	/// Minor device number (`T_DEV` only).
	pub minor: i16,
	/// Number of directory entries referring to this inode.
	pub nlink: i16,
	/// Size of the file in bytes.
	pub size:  u32,
	/// Direct block addresses, then one indirect block address.
	pub addrs: [u32; NDIRECT + 1],
}

impl Dinode {
	pub const EMPTY: Dinode = Dinode {
		ty:    0,
		major: 0,
		minor: 0,
		nlink: 0,
		size:  0,
		addrs: [0; NDIRECT + 1],
	};

	pub fn new(kind: InodeType) -> Self {
		Dinode {
			ty: kind.to_raw(),
			..Self::EMPTY
		}
	}

	pub fn kind(&self) -> Option<InodeType> {
		InodeType::from_raw(self.ty)
	}

	pub fn is_allocated(&self) -> bool {
		self.ty != 0
	}
}

/// Metadata summary of an inode.
#[derive(Debug, Clone, Copy)]
#[doc(alias = "Stat")]
pub struct InodeAttr {
	pub inum:  u32,
	pub kind:  InodeType,
	pub nlink: u16,
	pub size:  u32,
}

/// Location of the latest on-disk copy of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeLoc {
	/// Inode block holding the copy.
	pub block:   u32,
	/// Index of the copy within the block.
	pub slot:    u8,
	/// Incremented on truncate; lets the cleaner reject stale summary
	/// entries.
	pub version: u8,
}

/// One imap entry.
///
/// `Staged` marks an inode that was allocated but whose first on-disk copy
/// has not been flushed from the dirty buffer yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapSlot {
	Free,
	Staged,
	Located(InodeLoc),
}

const IMAP_STAGED: u32 = u32::MAX;
const IMAP_SLOT_MASK: u32 = (1 << IMAP_SLOT_BITS) - 1;
const IMAP_VERSION_MASK: u32 = (1 << IMAP_VERSION_BITS) - 1;

impl ImapSlot {
	/// On-disk encoding: `block << 12 | version << 4 | slot`, with 0 for a
	/// free entry and all-ones for a staged one.
	pub fn to_raw(self) -> u32 {
		match self {
			Self::Free => 0,
			Self::Staged => IMAP_STAGED,
			Self::Located(loc) => {
				(loc.block << (IMAP_SLOT_BITS + IMAP_VERSION_BITS))
					| ((loc.version as u32) << IMAP_SLOT_BITS)
					| (loc.slot as u32)
			}
		}
	}

	pub fn from_raw(raw: u32) -> Self {
		match raw {
			0 => Self::Free,
			IMAP_STAGED => Self::Staged,
			_ => Self::Located(InodeLoc {
				block:   raw >> (IMAP_SLOT_BITS + IMAP_VERSION_BITS),
				slot:    (raw & IMAP_SLOT_MASK) as u8,
				version: ((raw >> IMAP_SLOT_BITS) & IMAP_VERSION_MASK) as u8,
			}),
		}
	}

	pub fn located(self) -> Option<InodeLoc> {
		match self {
			Self::Located(loc) => Some(loc),
			_ => None,
		}
	}
}

/// Block classes described by a segment summary entry.
pub const SSB_DATA: u8 = 1;
pub const SSB_INODE: u8 = 2;
pub const SSB_INDIRECT: u8 = 3;

/// One segment summary entry; records the provenance of one log block so
/// the cleaner can decide whether it is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SsbEntry {
	pub kind:    u8,
	/// Inode version at the time the block was written.
	pub version: u8,
	pub inum:    u16,
	/// Logical block number for data blocks; [`NDIRECT`] for the indirect
	/// block itself; 0 for inode blocks.
	pub offset:  u32,
}

impl SsbEntry {
	pub fn data(inum: u32, bn: u32, version: u8) -> Self {
		SsbEntry {
			kind: SSB_DATA,
			version,
			inum: inum as u16,
			offset: bn,
		}
	}

	pub fn inode(inum: u32) -> Self {
		SsbEntry {
			kind:    SSB_INODE,
			version: 0,
			inum:    inum as u16,
			offset:  0,
		}
	}

	pub fn indirect(inum: u32, version: u8) -> Self {
		SsbEntry {
			kind: SSB_INDIRECT,
			version,
			inum: inum as u16,
			offset: NDIRECT as u32,
		}
	}
}

/// Segment summary block header, followed by [`SsbEntry`] records.
#[derive(Debug, Clone, Encode, Decode)]
pub struct SsbHeader {
	pub magic:         u32,
	/// Number of entries that follow.
	pub nblocks:       u32,
	pub checksum:      u32,
	pub timestamp:     u32,
	/// First block of the segment appended to after this one, or 0 if
	/// unknown at flush time.
	pub next_seg_addr: u32,
}

/// XOR checksum over the `(inum, offset, version)` triples of a summary.
pub fn ssb_checksum(entries: &[SsbEntry]) -> u32 {
	entries.iter().fold(0u32, |acc, e| {
		acc ^ (e.inum as u32) ^ e.offset ^ (e.version as u32)
	})
}

/// Encode a record into a byte buffer at offset 0.
pub(crate) fn encode_into<T: Encode>(val: &T, buf: &mut [u8]) -> std::io::Result<()> {
	let cfg = bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian();
	bincode::encode_into_slice(val, buf, cfg)
		.map(|_| ())
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "failed to encode"))
}

/// Decode a record from the start of a byte buffer.
pub(crate) fn decode_from<T: Decode>(buf: &[u8]) -> std::io::Result<T> {
	let cfg = bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian();
	bincode::decode_from_slice(buf, cfg)
		.map(|(v, _)| v)
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "failed to decode"))
}

/// Parse a block as a segment summary. Returns `None` unless both the
/// magic number and the checksum hold.
pub fn parse_ssb(buf: &[u8]) -> Option<(SsbHeader, Vec<SsbEntry>)> {
	let cfg = bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian();

	if buf.len() < SSB_HDR_SIZE {
		return None;
	}
	let (hdr, _): (SsbHeader, usize) = bincode::decode_from_slice(&buf[..SSB_HDR_SIZE], cfg).ok()?;
	if hdr.magic != SSB_MAGIC {
		return None;
	}
	let n = hdr.nblocks as usize;
	if n > SSB_ENTRIES_PER_BLOCK {
		return None;
	}

	let mut entries = Vec::with_capacity(n);
	for i in 0..n {
		let off = SSB_HDR_SIZE + i * SSB_ENTRY_SIZE;
		let (e, _): (SsbEntry, usize) =
			bincode::decode_from_slice(&buf[off..off + SSB_ENTRY_SIZE], cfg).ok()?;
		entries.push(e);
	}

	if ssb_checksum(&entries) != hdr.checksum {
		return None;
	}
	Some((hdr, entries))
}

/// One segment usage table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SutEntry {
	/// Bytes of live data in the segment; [`SUT_FREE`] marks a free
	/// segment.
	pub live: u16,
	/// Engine tick of the last mutation.
	pub age:  u16,
}

impl SutEntry {
	pub const FREE: SutEntry = SutEntry {
		live: SUT_FREE,
		age:  0,
	};

	pub fn is_free(&self) -> bool {
		self.live == SUT_FREE
	}
}

/// On-disk directory entry.
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct Dirent {
	pub inum: u16,
	pub name: [u8; DIRSIZ],
}

/// Size of one directory entry.
pub const DIRENT_SIZE: usize = 16;

impl Dirent {
	pub const EMPTY: Dirent = Dirent {
		inum: 0,
		name: [0; DIRSIZ],
	};

	/// Truncates `name` to [`DIRSIZ`] bytes, like the original tools do.
	pub fn new(inum: u32, name: &str) -> Self {
		let mut de = Dirent {
			inum: inum as u16,
			name: [0; DIRSIZ],
		};
		let b = name.as_bytes();
		let n = b.len().min(DIRSIZ);
		de.name[..n].copy_from_slice(&b[..n]);
		de
	}

	pub fn name(&self) -> &str {
		let len = self
			.name
			.iter()
			.position(|&b| b == 0)
			.unwrap_or(DIRSIZ);
		std::str::from_utf8(&self.name[..len]).unwrap_or("")
	}

	pub fn name_matches(&self, name: &str) -> bool {
		let b = name.as_bytes();
		if b.len() >= DIRSIZ {
			&self.name[..] == &b[..DIRSIZ]
		} else {
			self.name() == name
		}
	}
}

/// Geometry of a fresh image, passed to [`crate::mkfs::format`].
#[derive(Debug, Clone, Copy)]
pub struct FormatGeometry {
	/// Total image size in blocks.
	pub size:    u32,
	/// Segment size in blocks.
	pub segsize: u32,
	/// Maximum number of inodes.
	pub ninodes: u32,
}

impl Default for FormatGeometry {
	fn default() -> Self {
		FormatGeometry {
			size:    20000,
			segsize: 32,
			ninodes: 200,
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn imap_roundtrip() {
		let loc = InodeLoc {
			block:   12345,
			slot:    5,
			version: 200,
		};
		let raw = ImapSlot::Located(loc).to_raw();
		assert_eq!(ImapSlot::from_raw(raw), ImapSlot::Located(loc));
		assert_eq!(ImapSlot::from_raw(0), ImapSlot::Free);
		assert_eq!(ImapSlot::from_raw(u32::MAX), ImapSlot::Staged);
	}

	#[test]
	fn imap_version_wraps_at_8_bits() {
		let loc = InodeLoc {
			block:   7,
			slot:    3,
			version: 255,
		};
		let raw = ImapSlot::Located(loc).to_raw();
		let back = ImapSlot::from_raw(raw).located().unwrap();
		assert_eq!(back.version, 255);
		assert_eq!(back.block, 7);
	}

	#[test]
	fn ssb_checksum_xors_triples() {
		let entries = [SsbEntry::data(3, 9, 1), SsbEntry::indirect(3, 1)];
		let sum = ssb_checksum(&entries);
		assert_eq!(sum, 3u32 ^ 9 ^ 1 ^ 3 ^ NDIRECT as u32 ^ 1);
		assert_eq!(ssb_checksum(&[]), 0);
	}

	#[test]
	fn dirent_name_truncates() {
		let de = Dirent::new(2, "a-very-long-file-name");
		assert_eq!(de.name().len(), DIRSIZ);
		assert!(de.name_matches("a-very-long-file-name"));
		// only the first DIRSIZ bytes are significant
		assert!(de.name_matches("a-very-long-fi"));
		assert!(!de.name_matches("a-very-long"));

		let dot = Dirent::new(1, ".");
		assert_eq!(dot.name(), ".");
		assert!(dot.name_matches("."));
		assert!(!dot.name_matches(".."));
	}

	#[test]
	fn geometry_matches_layout() {
		assert_eq!(DINODE_SIZE * IPB, BSIZE);
		assert_eq!(DIRENT_SIZE * (BSIZE / DIRENT_SIZE), BSIZE);
		assert!(SSB_ENTRIES_PER_BLOCK >= 32 - 1);
	}

	#[test]
	fn on_disk_record_sizes() {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();
		let mut buf = [0u8; BSIZE];

		let n = bincode::encode_into_slice(Checkpoint::default(), &mut buf, cfg).unwrap();
		assert_eq!(n, CHECKPOINT_BODY_SIZE);

		let n = bincode::encode_into_slice(Dinode::EMPTY, &mut buf, cfg).unwrap();
		assert_eq!(n, DINODE_SIZE);

		let n = bincode::encode_into_slice(SsbEntry::data(1, 0, 0), &mut buf, cfg).unwrap();
		assert_eq!(n, SSB_ENTRY_SIZE);

		let n = bincode::encode_into_slice(Dirent::EMPTY, &mut buf, cfg).unwrap();
		assert_eq!(n, DIRENT_SIZE);

		let hdr = SsbHeader {
			magic:         SSB_MAGIC,
			nblocks:       0,
			checksum:      0,
			timestamp:     0,
			next_seg_addr: 0,
		};
		let n = bincode::encode_into_slice(hdr, &mut buf, cfg).unwrap();
		assert_eq!(n, SSB_HDR_SIZE);

		let n = bincode::encode_into_slice(SutEntry::FREE, &mut buf, cfg).unwrap();
		assert_eq!(n, BSIZE / SUT_PER_BLOCK);
	}
}
