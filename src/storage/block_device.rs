use anyhow::Result;

use crate::disk_format::block::BlockNumber;

/// A device addressed in fixed-size blocks.
///
/// The block size is the length of the buffer passed in, so the same device can be read with
/// 1 KiB blocks to find the superblock and with the filesystem's block size afterwards.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_number: BlockNumber, buf: &mut [u8]) -> Result<()>;

    fn write_block(&self, block_number: BlockNumber, buf: &[u8]) -> Result<()>;

    /// Makes previous writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
