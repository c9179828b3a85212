use std::sync::Mutex;

use anyhow::{anyhow, ensure, Result};

use crate::disk_format::block::BlockNumber;

use super::block_device::BlockDevice;

/// A block device held entirely in memory.
pub struct MemoryDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryDevice {
    /// Constructs a new [`MemoryDevice`] with `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the whole device.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn range(&self, block_number: BlockNumber, len: usize) -> Result<std::ops::Range<usize>> {
        let start = block_number
            .checked_mul(len)
            .ok_or(anyhow!("block number {block_number} overflows"))?;
        let end = start
            .checked_add(len)
            .ok_or(anyhow!("block number {block_number} overflows"))?;

        ensure!(
            end <= self.len(),
            "block number out of bounds: {block_number}"
        );

        Ok(start..end)
    }
}

impl BlockDevice for MemoryDevice {
    fn read_block(&self, block_number: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let range = self.range(block_number, buf.len())?;
        buf.copy_from_slice(&self.lock()[range]);

        Ok(())
    }

    fn write_block(&self, block_number: BlockNumber, buf: &[u8]) -> Result<()> {
        let range = self.range(block_number, buf.len())?;
        self.lock()[range].copy_from_slice(buf);

        Ok(())
    }
}
