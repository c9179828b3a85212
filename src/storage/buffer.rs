use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use anyhow::{Context, Result};
use log::debug;

use crate::disk_format::block::BlockNumber;

use super::block_device::BlockDevice;

/// A write-back cache of the blocks of one device.
///
/// [`BufferCache::read`] hands out [`Buffer`]s that own their block exclusively: a second reader
/// of the same block waits until the first buffer is dropped. Dropping a buffer marked dirty keeps
/// its contents in the cache; [`BufferCache::sync`] writes them to the device.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    state: Mutex<CacheState>,
    released: Condvar,
}

#[derive(Default)]
struct CacheState {
    /// Blocks currently handed out.
    busy: HashSet<BlockNumber>,
    /// Released blocks that differ from the device.
    dirty: HashMap<BlockNumber, Vec<u8>>,
}

/// An exclusively owned copy of one block.
pub struct Buffer<'c> {
    cache: &'c BufferCache,
    block_number: BlockNumber,
    data: Vec<u8>,
    dirty: bool,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize) -> Self {
        Self {
            device,
            block_size,
            state: Mutex::new(CacheState::default()),
            released: Condvar::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.device)
    }

    /// Reads a block, waiting for any other holder of the same block to release it first.
    pub fn read(&self, block_number: BlockNumber) -> Result<Buffer<'_>> {
        let mut state = self.lock();
        while state.busy.contains(&block_number) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.busy.insert(block_number);
        let cached = state.dirty.get(&block_number).cloned();
        drop(state);

        // from here on the buffer releases the block, even on the error path below
        let mut buffer = Buffer {
            cache: self,
            block_number,
            data: Vec::new(),
            dirty: false,
        };

        buffer.data = match cached {
            Some(data) => data,
            None => {
                let mut data = vec![0; self.block_size];
                self.device
                    .read_block(block_number, &mut data)
                    .with_context(|| format!("reading block {block_number}"))?;
                data
            }
        };

        Ok(buffer)
    }

    /// Writes every dirty block to the device and flushes it.
    pub fn sync(&self) -> Result<()> {
        let mut dirty = self
            .lock()
            .dirty
            .iter()
            .map(|(block_number, data)| (*block_number, data.clone()))
            .collect::<Vec<_>>();
        dirty.sort_by_key(|(block_number, _)| *block_number);

        debug!("syncing {} dirty blocks", dirty.len());

        for (block_number, data) in dirty {
            self.device
                .write_block(block_number, &data)
                .with_context(|| format!("writing back block {block_number}"))?;

            // keep the entry if the block was dirtied again while we were writing
            let mut state = self.lock();
            if state.dirty.get(&block_number) == Some(&data) {
                state.dirty.remove(&block_number);
            }
        }

        self.device.flush()
    }

    /// The number of released blocks that still have to be written to the device.
    pub fn dirty_count(&self) -> usize {
        self.lock().dirty.len()
    }

    fn release(&self, block_number: BlockNumber, data: Option<Vec<u8>>) {
        let mut state = self.lock();
        state.busy.remove(&block_number);
        if let Some(data) = data {
            state.dirty.insert(block_number, data);
        }
        drop(state);

        self.released.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Buffer<'_> {
    pub fn block_number(&self) -> BlockNumber {
        self.block_number
    }

    /// Marks the buffer as modified. Its contents reach the device on the next sync.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Deref for Buffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        let data = self.dirty.then(|| std::mem::take(&mut self.data));
        self.cache.release(self.block_number, data);
    }
}
