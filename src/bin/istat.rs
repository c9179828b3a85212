use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ext2_icache::config::Config;
use ext2_icache::directory::resolve_path;
use ext2_icache::disk_format::inode::ROOT_INODE;
use ext2_icache::inode_table::InodeTable;
use ext2_icache::mount::DeviceId;
use ext2_icache::resolver::block_map;
use ext2_icache::storage::FileBackedDevice;

/// Prints the inode a path names and the blocks holding its data.
#[derive(Parser)]
struct Args {
    /// ext2 disk image
    disk_file: PathBuf,
    /// Absolute path inside the image
    path: String,
    /// Device number to mount the image as
    #[arg(long, default_value_t = 0x0301)]
    dev: u16,
    #[command(flatten)]
    config: Config,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let disk_file = File::options()
        .read(true)
        .open(&args.disk_file)
        .with_context(|| format!("unable to open {}", args.disk_file.display()))?;
    let dev = DeviceId(args.dev);

    let table = InodeTable::new(args.config);
    table.mount(dev, Arc::new(FileBackedDevice::new(disk_file)), None)?;

    let root = table.acquire(dev, ROOT_INODE)?;
    let handle = resolve_path(&table, &root, &args.path)?;
    let key = handle.key().context("path resolved to an anonymous inode")?;
    let record = handle.record();

    println!("inode {key}");
    println!("  kind:  {:?}", record.kind());
    println!("  mode:  {:o}", record.mode);
    println!("  links: {}", record.links_count);
    println!("  owner: {}:{}", record.uid, record.gid);
    println!("  size:  {}", record.size);

    let mount = table
        .mounts()
        .mount_for(key.dev)
        .with_context(|| format!("device {} is not mounted", key.dev))?;
    let blocks = block_map(mount.super_block().cache(), &record)?;
    println!("  blocks ({}):", blocks.len());
    for (index, block_number) in blocks {
        println!("    {index:>8} -> {block_number}");
    }

    Ok(())
}
