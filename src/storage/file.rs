use std::fs::File;
use std::os::unix::prelude::FileExt;

use anyhow::{Context, Result};

use crate::disk_format::block::BlockNumber;

use super::block_device::BlockDevice;

/// A block device backed by a disk image file.
pub struct FileBackedDevice(File);

impl FileBackedDevice {
    pub fn new(file: File) -> Self {
        FileBackedDevice(file)
    }
}

impl BlockDevice for FileBackedDevice {
    fn read_block(&self, block_number: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let position = block_number * buf.len();

        self.0
            .read_exact_at(buf, position as u64)
            .with_context(|| format!("reading block {block_number}"))?;

        Ok(())
    }

    fn write_block(&self, block_number: BlockNumber, buf: &[u8]) -> Result<()> {
        let position = block_number * buf.len();

        self.0
            .write_all_at(buf, position as u64)
            .with_context(|| format!("writing block {block_number}"))?;

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.0.sync_data().context("syncing disk image")
    }
}
