use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};

use crate::bitmap::{Bitmap, BitmapCache};
use crate::config::Config;
use crate::disk_format::block::{
    addr_per_block, block_size_from_log, BlockNumber, SUPER_BLOCK_OFFSET, SUPER_BLOCK_SIZE,
};
use crate::disk_format::group_descriptor::{GroupDescriptor, GroupNumber, GROUP_DESCRIPTOR_SIZE};
use crate::disk_format::inode::INODE_SIZE;
use crate::disk_format::super_block::{DiskSuperBlock, EXT2_MAGIC, GOOD_OLD_REV};
use crate::error::Fatal;
use crate::mount::DeviceId;
use crate::storage::{BlockDevice, BufferCache};

/// Sizes and counts derived from the superblock when the filesystem is mounted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub blocks_count: usize,
    pub inodes_count: usize,
    pub first_data_block: BlockNumber,
    pub blocks_per_group: usize,
    pub inodes_per_group: usize,
    pub inode_size: usize,
    pub inodes_per_block: usize,
    pub groups_count: usize,
    pub desc_per_block: usize,
    /// The number of blocks holding the group descriptor table.
    pub desc_blocks: usize,
    /// The number of blocks of each group's inode table.
    pub inode_table_blocks: usize,
    pub addr_per_block: usize,
}

impl Geometry {
    pub fn new(disk: &DiskSuperBlock) -> Result<Self> {
        ensure!(
            disk.magic == EXT2_MAGIC,
            "bad magic number {:#06x} (not an ext2 filesystem)",
            disk.magic
        );

        let Some(block_size) = block_size_from_log(disk.log_block_size) else {
            bail!("unsupported block size (log {})", disk.log_block_size);
        };

        let inode_size = if disk.rev_level == GOOD_OLD_REV {
            INODE_SIZE
        } else {
            disk.inode_size as usize
        };
        ensure!(
            inode_size >= INODE_SIZE && inode_size <= block_size && inode_size.is_power_of_two(),
            "unsupported inode size {inode_size}"
        );

        let blocks_per_group = disk.blocks_per_group as usize;
        let inodes_per_group = disk.inodes_per_group as usize;
        let blocks_count = disk.blocks_count as usize;
        let first_data_block = disk.first_data_block as usize;

        if blocks_per_group == 0 || inodes_per_group == 0 {
            bail!("invalid group geometry: {blocks_per_group} blocks and {inodes_per_group} inodes per group");
        }

        ensure!(
            blocks_per_group % 8 == 0 && blocks_per_group <= block_size * 8,
            "block bitmap of {blocks_per_group} bits does not fit a block"
        );
        ensure!(
            inodes_per_group % 8 == 0 && inodes_per_group <= block_size * 8,
            "inode bitmap of {inodes_per_group} bits does not fit a block"
        );
        ensure!(
            blocks_count > first_data_block,
            "invalid number of blocks: {blocks_count}"
        );

        let groups_count = (blocks_count - first_data_block).div_ceil(blocks_per_group);
        let inodes_per_block = block_size / inode_size;
        let desc_per_block = block_size / GROUP_DESCRIPTOR_SIZE;

        ensure!(
            disk.inodes_count as usize <= groups_count * inodes_per_group,
            "{} inodes do not fit in {groups_count} groups",
            disk.inodes_count
        );

        Ok(Self {
            block_size,
            blocks_count,
            inodes_count: disk.inodes_count as usize,
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            inode_size,
            inodes_per_block,
            groups_count,
            desc_per_block,
            desc_blocks: groups_count.div_ceil(desc_per_block),
            inode_table_blocks: inodes_per_group.div_ceil(inodes_per_block),
            addr_per_block: addr_per_block(block_size),
        })
    }
}

/// Whether `group` carries a backup of the superblock and the descriptor table.
///
/// Without `sparse_super` every group does. With it, only groups 0 and 1 and the powers of 3, 5
/// and 7 do.
pub fn has_super_backup(group: GroupNumber, sparse_super: bool) -> bool {
    fn is_power_of(mut n: GroupNumber, base: GroupNumber) -> bool {
        while n > 1 && n % base == 0 {
            n /= base;
        }
        n == 1
    }

    !sparse_super || group <= 1 || [3, 5, 7].iter().any(|base| is_power_of(group, *base))
}

/// A mounted filesystem's superblock, descriptor table and bitmap caches.
pub struct SuperBlock {
    dev: DeviceId,
    geometry: Geometry,
    sparse_super: bool,
    cache: BufferCache,
    disk: Mutex<DiskSuperBlock>,
    descriptors: Mutex<Vec<GroupDescriptor>>,
    block_bitmaps: Mutex<BitmapCache>,
    inode_bitmaps: Mutex<BitmapCache>,
}

impl SuperBlock {
    /// Reads and validates the superblock and the group descriptor table of `device`.
    pub fn load(dev: DeviceId, device: Arc<dyn BlockDevice>, config: &Config) -> Result<Self> {
        // the superblock lives at byte 1024 whatever the block size is
        let mut raw = [0; SUPER_BLOCK_SIZE];
        let raw_block = SUPER_BLOCK_OFFSET / SUPER_BLOCK_SIZE;
        device
            .read_block(raw_block, &mut raw)
            .context(Fatal::MetadataUnreadable {
                dev,
                what: "superblock",
                block: raw_block,
            })?;

        let disk = DiskSuperBlock::decode(&raw)?;
        let geometry =
            Geometry::new(&disk).with_context(|| format!("invalid superblock on device {dev}"))?;

        info!(
            "device {dev}: {} blocks of {} bytes, {} inodes, {} groups",
            geometry.blocks_count, geometry.block_size, geometry.inodes_count, geometry.groups_count
        );

        let cache = BufferCache::new(device, geometry.block_size);

        let mut descriptors = Vec::with_capacity(geometry.groups_count);
        for i in 0..geometry.desc_blocks {
            let block_number = geometry.first_data_block + 1 + i;
            let buffer = cache.read(block_number).context(Fatal::MetadataUnreadable {
                dev,
                what: "group descriptors",
                block: block_number,
            })?;
            descriptors.extend(GroupDescriptor::decode_block(&buffer));
        }
        descriptors.truncate(geometry.groups_count);

        let capacity = config.bitmap_cache_capacity;

        Ok(Self {
            dev,
            geometry,
            sparse_super: disk.has_sparse_super(),
            cache,
            disk: Mutex::new(disk),
            descriptors: Mutex::new(descriptors),
            block_bitmaps: Mutex::new(BitmapCache::new("block", geometry.groups_count, capacity)),
            inode_bitmaps: Mutex::new(BitmapCache::new("inode", geometry.groups_count, capacity)),
        })
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// A copy of the in-core superblock.
    pub fn disk(&self) -> DiskSuperBlock {
        lock(&self.disk).clone()
    }

    /// # Panics
    ///
    /// Panics if `group` is not a group of the filesystem.
    pub fn descriptor(&self, group: GroupNumber) -> GroupDescriptor {
        lock(&self.descriptors)[group]
    }

    pub fn descriptors(&self) -> Vec<GroupDescriptor> {
        lock(&self.descriptors).clone()
    }

    pub fn update_descriptor<R>(
        &self,
        group: GroupNumber,
        f: impl FnOnce(&mut GroupDescriptor) -> R,
    ) -> R {
        f(&mut lock(&self.descriptors)[group])
    }

    pub fn update_counts<R>(&self, f: impl FnOnce(&mut DiskSuperBlock) -> R) -> R {
        f(&mut lock(&self.disk))
    }

    pub fn group_has_super_backup(&self, group: GroupNumber) -> bool {
        has_super_backup(group, self.sparse_super)
    }

    /// Runs `f` on the block bitmap of `group`.
    pub fn with_block_bitmap<R>(
        &self,
        group: GroupNumber,
        f: impl FnOnce(&mut Bitmap) -> R,
    ) -> Result<R> {
        let block_number = self.descriptor(group).block_bitmap();
        let mut bitmaps = lock(&self.block_bitmaps);

        Ok(f(bitmaps.load(group, block_number, &self.cache)?))
    }

    /// Runs `f` on the inode bitmap of `group`.
    pub fn with_inode_bitmap<R>(
        &self,
        group: GroupNumber,
        f: impl FnOnce(&mut Bitmap) -> R,
    ) -> Result<R> {
        let block_number = self.descriptor(group).inode_bitmap();
        let mut bitmaps = lock(&self.inode_bitmaps);

        Ok(f(bitmaps.load(group, block_number, &self.cache)?))
    }

    /// Writes the superblock, the descriptor table and every dirty bitmap, then flushes the
    /// buffer cache to the device.
    pub fn sync(&self) -> Result<()> {
        debug!("syncing superblock of device {}", self.dev);

        let block_size = self.geometry.block_size;
        let block_number = SUPER_BLOCK_OFFSET / block_size;
        let offset = SUPER_BLOCK_OFFSET % block_size;
        {
            let mut buffer = self.cache.read(block_number)?;
            lock(&self.disk).encode_into(&mut buffer[offset..offset + SUPER_BLOCK_SIZE]);
            buffer.mark_dirty();
        }

        let descriptors = self.descriptors();
        for (i, chunk) in descriptors.chunks(self.geometry.desc_per_block).enumerate() {
            let mut buffer = self.cache.read(self.geometry.first_data_block + 1 + i)?;
            for (index, descriptor) in chunk.iter().enumerate() {
                descriptor.encode_into_block(&mut buffer, index);
            }
            buffer.mark_dirty();
        }

        lock(&self.block_bitmaps).flush(&self.cache)?;
        lock(&self.inode_bitmaps).flush(&self.cache)?;

        self.cache.sync()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
