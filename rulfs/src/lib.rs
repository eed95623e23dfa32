mod blockdev;
mod codec;
mod data;
mod lfs;
mod mkfs;

pub use crate::{
	blockdev::{Backend, BlockDev},
	data::{
		parse_ssb, Checkpoint, Dinode, Dirent, FormatGeometry, ImapSlot, InodeAttr, InodeLoc,
		InodeType, SsbEntry, SsbHeader, Superblock, BSIZE, DIRENT_SIZE, GC_TARGET_SEGS,
		GC_THRESHOLD, IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO, SSB_MAGIC,
	},
	lfs::{Info, Lfs},
	mkfs::format,
};

#[cfg(feature = "bcache")]
pub(crate) const BCACHE_SIZE: usize = 256;

#[cfg(feature = "bcache")]
pub(crate) fn new_lru<K: std::hash::Hash + Eq, V>(size: usize) -> lru::LruCache<K, V> {
	lru::LruCache::new(std::num::NonZeroUsize::new(size).unwrap())
}
