use std::io::{Error as IoError, Result as IoResult};

use super::{EngineState, Lfs};
use crate::{blockdev::Backend, data::*, err};

impl<R: Backend> Lfs<R> {
	/// Iterate the entries of a directory, calling `f` for each one until
	/// it returns `Some`.
	pub fn dir_iter<T>(
		&mut self,
		dinum: u32,
		mut f: impl FnMut(&Dirent, u32) -> Option<T>,
	) -> IoResult<Option<T>> {
		let din = self.read_inode(dinum)?;
		if din.kind() != Some(InodeType::Directory) {
			return Err(err!(ENOTDIR));
		}

		let mut buf = [0u8; DIRENT_SIZE];
		let mut off = 0;
		while off + DIRENT_SIZE as u32 <= din.size {
			let n = self.inode_read(dinum, off, &mut buf)?;
			if n != DIRENT_SIZE {
				log::error!("dir_iter({dinum}): short read at {off}");
				return Err(err!(EIO));
			}
			let de: Dirent = decode_from(&buf)?;
			if de.inum != 0 {
				if let Some(x) = f(&de, off) {
					return Ok(Some(x));
				}
			}
			off += DIRENT_SIZE as u32;
		}
		Ok(None)
	}

	/// Find the entry `name` in the directory `dinum`.
	#[doc(alias = "dirlookup")]
	pub fn dir_lookup(&mut self, dinum: u32, name: &str) -> IoResult<u32> {
		log::trace!("dir_lookup({dinum}, {name:?});");
		self.do_dir_lookup(dinum, name)?
			.ok_or_else(|| err!(ENOENT))
	}

	pub(crate) fn do_dir_lookup(&mut self, dinum: u32, name: &str) -> IoResult<Option<u32>> {
		self.dir_iter(dinum, |de, _| {
			if de.name_matches(name) {
				Some(de.inum as u32)
			} else {
				None
			}
		})
	}

	/// List a directory.
	pub fn read_dir(&mut self, dinum: u32) -> IoResult<Vec<(String, u32)>> {
		let mut out = Vec::new();
		self.dir_iter(dinum, |de, _| {
			out.push((de.name().to_string(), de.inum as u32));
			None::<()>
		})?;
		Ok(out)
	}

	/// Write a new directory entry `(name, inum)` into directory `dinum`.
	#[doc(alias = "dirlink")]
	pub fn dir_link(&mut self, dinum: u32, name: &str, inum: u32) -> IoResult<()> {
		self.assert_rw()?;
		self.maybe_clean()?;
		self.enter(EngineState::Serving)?;
		let r = self.do_dir_link(dinum, name, inum);
		self.leave();
		r?;
		self.sync_if_full()
	}

	pub(crate) fn do_dir_link(&mut self, dinum: u32, name: &str, inum: u32) -> IoResult<()> {
		log::trace!("dir_link({dinum}, {name:?}, {inum});");
		if self.do_dir_lookup(dinum, name)?.is_some() {
			return Err(err!(EEXIST));
		}

		// reuse a cleared slot if there is one, otherwise append
		let din = self.read_inode(dinum)?;
		let mut off = din.size;
		let mut buf = [0u8; DIRENT_SIZE];
		let mut pos = 0;
		while pos + DIRENT_SIZE as u32 <= din.size {
			self.inode_read(dinum, pos, &mut buf)?;
			let de: Dirent = decode_from(&buf)?;
			if de.inum == 0 {
				off = pos;
				break;
			}
			pos += DIRENT_SIZE as u32;
		}

		let de = Dirent::new(inum, name);
		encode_into(&de, &mut buf)?;
		let n = self.do_inode_write(dinum, off, &buf)?;
		if n != DIRENT_SIZE {
			log::error!("dir_link({dinum}): short write");
			return Err(err!(EIO));
		}
		Ok(())
	}

	/// Whether a directory holds anything besides `.` and `..`.
	pub(crate) fn dir_is_empty(&mut self, dinum: u32) -> IoResult<bool> {
		let x = self.dir_iter(dinum, |de, _| {
			if de.name_matches(".") || de.name_matches("..") {
				None
			} else {
				Some(())
			}
		})?;
		Ok(x.is_none())
	}

	/// Resolve a path to an inode, starting at the root directory.
	#[doc(alias = "namei")]
	pub fn lookup_path(&mut self, path: &str) -> IoResult<u32> {
		log::trace!("lookup_path({path:?});");
		let mut inum = ROOTINO;
		for part in path.split('/').filter(|p| !p.is_empty()) {
			inum = self.dir_lookup(inum, part)?;
		}
		Ok(inum)
	}

	/// Resolve a path to its parent directory and final component.
	#[doc(alias = "nameiparent")]
	pub(crate) fn lookup_parent<'p>(&mut self, path: &'p str) -> IoResult<(u32, &'p str)> {
		let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
		let Some((&last, dirs)) = parts.split_last() else {
			return Err(err!(EINVAL));
		};
		let mut inum = ROOTINO;
		for part in dirs {
			inum = self.dir_lookup(inum, part)?;
		}
		Ok((inum, last))
	}

	/// Create a file or directory at `path` and link it into its parent.
	pub fn create(&mut self, path: &str, kind: InodeType) -> IoResult<u32> {
		log::trace!("create({path:?}, {kind:?});");
		self.assert_rw()?;
		self.maybe_clean()?;

		let (dp, name) = self.lookup_parent(path)?;
		if self.do_dir_lookup(dp, name)?.is_some() {
			return Err(err!(EEXIST));
		}

		self.enter(EngineState::Serving)?;
		let r = self.do_create(dp, name, kind);
		self.leave();
		let inum = r?;
		self.sync_if_full()?;
		Ok(inum)
	}

	fn do_create(&mut self, dp: u32, name: &str, kind: InodeType) -> IoResult<u32> {
		let inum = self.do_inode_alloc(kind)?;
		let mut din = self.read_inode(inum)?;
		din.nlink = 1;
		self.stage_inode(inum, &din)?;

		if kind == InodeType::Directory {
			// parent gains a link through "..", but "." does not count
			let mut pd = self.read_inode(dp)?;
			pd.nlink += 1;
			self.stage_inode(dp, &pd)?;

			self.do_dir_link(inum, ".", inum)?;
			self.do_dir_link(inum, "..", dp)?;
		}

		self.do_dir_link(dp, name, inum)?;
		Ok(inum)
	}

	/// Remove the link at `path`; the inode is freed once its last link
	/// and reference are gone.
	pub fn unlink(&mut self, path: &str) -> IoResult<()> {
		log::trace!("unlink({path:?});");
		self.assert_rw()?;
		self.maybe_clean()?;

		let (dp, name) = self.lookup_parent(path)?;
		if name == "." || name == ".." {
			return Err(err!(EINVAL));
		}

		self.enter(EngineState::Serving)?;
		let r = self.do_unlink(dp, name);
		self.leave();
		match r? {
			Some(freed) => self.inode_put(freed),
			None => self.sync_if_full(),
		}
	}

	fn do_unlink(&mut self, dp: u32, name: &str) -> IoResult<Option<u32>> {
		let found = self.dir_iter(dp, |de, off| {
			if de.name_matches(name) {
				Some((de.inum as u32, off))
			} else {
				None
			}
		})?;
		let Some((inum, off)) = found else {
			return Err(err!(ENOENT));
		};

		let mut din = self.read_inode(inum)?;
		if din.kind() == Some(InodeType::Directory) && !self.dir_is_empty(inum)? {
			return Err(err!(ENOTEMPTY));
		}

		let mut buf = [0u8; DIRENT_SIZE];
		encode_into(&Dirent::EMPTY, &mut buf)?;
		self.do_inode_write(dp, off, &buf)?;

		if din.kind() == Some(InodeType::Directory) {
			let mut pd = self.read_inode(dp)?;
			pd.nlink -= 1;
			self.stage_inode(dp, &pd)?;
		}

		din.nlink -= 1;
		self.stage_inode(inum, &din)?;
		Ok((din.nlink == 0).then_some(inum))
	}
}
