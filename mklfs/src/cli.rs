use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Path to the image file to create
	pub image: PathBuf,

	/// Host files to install into the root directory
	pub files: Vec<PathBuf>,

	/// Image size in blocks
	#[arg(long, default_value_t = 20000)]
	pub size: u32,

	/// Segment size in blocks
	#[arg(long, default_value_t = 32)]
	pub segsize: u32,

	/// Maximum number of inodes
	#[arg(long, default_value_t = 200)]
	pub ninodes: u32,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}
