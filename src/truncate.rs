//! Freeing the blocks and inode numbers of deleted files.

use anyhow::{ensure, Context, Result};
use log::{debug, warn};

use crate::disk_format::block::{read_pointer, BlockNumber};
use crate::disk_format::inode::{
    FileKind, Inode, InodeNumber, DIND_BLOCK, IND_BLOCK, NUM_BLOCK_POINTERS, TIND_BLOCK,
};
use crate::resolver::group_of_block;
use crate::super_block::SuperBlock;

/// Frees every data and indirect block of `inode` and resets its size.
///
/// Only regular files, directories and symlinks that do not keep their target inline own
/// blocks; the pointers of other inodes are left alone.
pub fn truncate(super_block: &SuperBlock, inode: &mut Inode) -> Result<()> {
    let owns_blocks = match inode.kind() {
        FileKind::Regular | FileKind::Directory => true,
        FileKind::Symlink => inode.blocks != 0,
        _ => false,
    };
    if !owns_blocks {
        return Ok(());
    }

    for slot in 0..NUM_BLOCK_POINTERS {
        let depth = match slot {
            IND_BLOCK => 1,
            DIND_BLOCK => 2,
            TIND_BLOCK => 3,
            _ => 0,
        };

        let block_number = inode.block[slot] as BlockNumber;
        if block_number != 0 {
            free_tree(super_block, block_number, depth)?;
            inode.block[slot] = 0;
        }
    }

    inode.size = 0;
    inode.dir_acl = 0;
    inode.blocks = 0;

    Ok(())
}

/// Frees `block_number` and, for indirect blocks, everything it points to.
fn free_tree(super_block: &SuperBlock, block_number: BlockNumber, depth: usize) -> Result<()> {
    if depth > 0 {
        let pointers = {
            let indirect = super_block
                .cache()
                .read(block_number)
                .with_context(|| format!("reading indirect block {block_number}"))?;

            (0..super_block.geometry().addr_per_block)
                .map(|index| read_pointer(&indirect, index))
                .filter(|pointer| *pointer != 0)
                .collect::<Vec<_>>()
        };

        for pointer in pointers {
            free_tree(super_block, pointer, depth - 1)?;
        }
    }

    free_block(super_block, block_number)
}

/// Marks a block free in its group's bitmap and updates the free counts.
pub fn free_block(super_block: &SuperBlock, block_number: BlockNumber) -> Result<()> {
    let geometry = super_block.geometry();
    ensure!(
        block_number >= geometry.first_data_block && block_number < geometry.blocks_count,
        "freeing block {block_number} outside the filesystem"
    );

    let group = group_of_block(geometry, block_number);
    let bit = (block_number - geometry.first_data_block) % geometry.blocks_per_group;

    let was_used = super_block.with_block_bitmap(group, |bitmap| bitmap.clear(bit))?;
    if !was_used {
        warn!("device {}: bit already cleared for block {block_number}", super_block.dev());
        return Ok(());
    }

    let dev = super_block.dev();
    let counted = super_block.update_descriptor(group, |descriptor| {
        increment(&mut descriptor.free_blocks_count)
    });
    if !counted {
        warn!("device {dev}: free block count of group {group} is already at its maximum");
    }
    if !super_block.update_counts(|disk| increment(&mut disk.free_blocks_count)) {
        warn!("device {dev}: free block count is already at its maximum");
    }

    Ok(())
}

/// Marks an inode number free in its group's bitmap and updates the free counts.
pub fn free_inode(super_block: &SuperBlock, ino: InodeNumber, was_directory: bool) -> Result<()> {
    let geometry = super_block.geometry();
    ensure!(
        ino != 0 && ino as usize <= geometry.inodes_count,
        "freeing nonexistent inode {ino}"
    );

    let group = (ino as usize - 1) / geometry.inodes_per_group;
    let bit = (ino as usize - 1) % geometry.inodes_per_group;

    let was_used = super_block.with_inode_bitmap(group, |bitmap| bitmap.clear(bit))?;
    if !was_used {
        warn!("device {}: bit already cleared for inode {ino}", super_block.dev());
        return Ok(());
    }

    debug!("device {}: freed inode {ino}", super_block.dev());

    let dev = super_block.dev();
    let counted = super_block.update_descriptor(group, |descriptor| {
        if was_directory {
            descriptor.used_dirs_count = descriptor.used_dirs_count.saturating_sub(1);
        }
        increment(&mut descriptor.free_inodes_count)
    });
    if !counted {
        warn!("device {dev}: free inode count of group {group} is already at its maximum");
    }
    if !super_block.update_counts(|disk| increment(&mut disk.free_inodes_count)) {
        warn!("device {dev}: free inode count is already at its maximum");
    }

    Ok(())
}

/// Adds one to a count read from the disk. Returns `false`, leaving the count alone, if it is
/// already at the maximum of its type.
fn increment<T>(count: &mut T) -> bool
where
    T: Copy + Into<u64> + TryFrom<u64>,
{
    match T::try_from(Into::<u64>::into(*count) + 1) {
        Ok(incremented) => {
            *count = incremented;
            true
        }
        Err(_) => false,
    }
}
