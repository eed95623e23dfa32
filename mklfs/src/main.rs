use std::fs::File;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rulfs::{format, BlockDev, FormatGeometry, InodeType, BSIZE};

use crate::cli::Cli;

mod cli;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let geo = FormatGeometry {
		size:    cli.size,
		segsize: cli.segsize,
		ninodes: cli.ninodes,
	};

	let file = File::options()
		.read(true)
		.write(true)
		.create(true)
		.truncate(true)
		.open(&cli.image)
		.with_context(|| format!("cannot create {}", cli.image.display()))?;
	file.set_len(geo.size as u64 * BSIZE as u64)?;

	let mut fs = format(BlockDev::new(file, true), &geo)
		.with_context(|| format!("cannot format {}", cli.image.display()))?;

	for path in &cli.files {
		let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
			bail!("bad file name: {}", path.display());
		};
		let data =
			std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;

		let inum = fs.create(&format!("/{name}"), InodeType::RegularFile)?;
		let n = fs.inode_write(inum, 0, &data)?;
		if n != data.len() {
			bail!("short write installing {name}: {n} of {} bytes", data.len());
		}
		log::info!("installed {name} ({n} bytes)");
	}

	fs.sync()?;

	let info = fs.info();
	println!(
		"mklfs: {} blocks, {} segments ({} free), {} inodes ({} free)",
		info.blocks, info.segments, info.sfree, info.files, info.ffree
	);
	Ok(())
}
