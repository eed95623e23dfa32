use std::io::{BufRead, Error, ErrorKind, Result, Seek, SeekFrom, Write};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// All on-disk records are little-endian with fixed-width integers.
#[derive(Clone, Copy)]
pub struct Config {
	cfg: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl Config {
	pub const fn little() -> Self {
		let cfg = bincode::config::standard()
			.with_fixed_int_encoding()
			.with_little_endian();
		Self {
			cfg,
		}
	}

	fn decode<T: Decode, R: BufRead>(&self, rdr: &mut R) -> Result<T> {
		bincode::decode_from_std_read(rdr, self.cfg)
			.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
	}

	fn encode<T: Encode, W: Write>(&self, val: &T, wr: &mut W) -> Result<()> {
		bincode::encode_into_std_write(val, wr, self.cfg)
			.map(|_| ())
			.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to encode"))
	}
}

/// Typed positional access to the backing medium.
pub struct Decoder<T: BufRead> {
	inner:  T,
	config: Config,
}

impl<T: BufRead> Decoder<T> {
	pub fn new(inner: T, config: Config) -> Self {
		Self {
			inner,
			config,
		}
	}

	pub fn inner(&self) -> &T {
		&self.inner
	}

	pub fn inner_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn into_inner(self) -> T {
		self.inner
	}

	pub fn decode<X: Decode>(&mut self) -> Result<X> {
		self.config.decode(&mut self.inner)
	}

	pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
		self.inner.read_exact(buf)
	}

	pub fn config(&self) -> Config {
		self.config
	}
}

impl<T: BufRead + Write> Decoder<T> {
	pub fn encode<X: Encode>(&mut self, val: &X) -> Result<()> {
		self.config.encode(val, &mut self.inner)
	}

	pub fn write(&mut self, buf: &[u8]) -> Result<()> {
		self.inner.write_all(buf)
	}

	pub fn fill(&mut self, byte: u8, len: usize) -> Result<()> {
		let chunk = [byte; 64];
		let mut left = len;
		while left > 0 {
			let n = left.min(chunk.len());
			self.inner.write_all(&chunk[..n])?;
			left -= n;
		}
		Ok(())
	}
}

impl<T: BufRead + Seek> Decoder<T> {
	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
		self.seek(pos)?;
		self.read(buf)
	}

	pub fn decode_at<X: Decode>(&mut self, pos: u64) -> Result<X> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn seek(&mut self, pos: u64) -> Result<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}

	pub fn pos(&mut self) -> Result<u64> {
		self.inner.stream_position()
	}
}

impl<T: BufRead + Write + Seek> Decoder<T> {
	pub fn encode_at<X: Encode>(&mut self, pos: u64, val: &X) -> Result<()> {
		self.seek(pos)?;
		self.encode(val)
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
		self.seek(pos)?;
		self.write(buf)
	}

	pub fn fill_at(&mut self, pos: u64, byte: u8, len: usize) -> Result<()> {
		self.seek(pos)?;
		self.fill(byte, len)
	}
}
