use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ext2_icache::checker::Checker;
use ext2_icache::config::Config;
use ext2_icache::inode_table::InodeTable;
use ext2_icache::mount::DeviceId;
use ext2_icache::storage::FileBackedDevice;

#[derive(Parser)]
struct Args {
    /// ext2 disk image
    disk_file: PathBuf,
    /// Device number to mount the image as
    #[arg(long, default_value_t = 0x0301)]
    dev: u16,
    #[command(flatten)]
    config: Config,
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = Args::parse();

    let disk_file = File::options()
        .read(true)
        .open(&args.disk_file)
        .with_context(|| format!("unable to open {}", args.disk_file.display()))?;
    let dev = DeviceId(args.dev);

    let table = InodeTable::new(args.config);
    table.mount(dev, Arc::new(FileBackedDevice::new(disk_file)), None)?;

    let mount = table
        .mounts()
        .mount_for(dev)
        .context("filesystem vanished after mounting")?;
    let report = Checker::new(mount.super_block()).check_all();
    println!("{report}");

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
