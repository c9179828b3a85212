//! Translation of logical file blocks and inode numbers to physical block numbers.

use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::disk_format::block::{addr_per_block, read_pointer, BlockNumber};
use crate::disk_format::group_descriptor::GroupNumber;
use crate::disk_format::inode::{Inode, InodeNumber, DIND_BLOCK, IND_BLOCK, NUM_DIRECT, TIND_BLOCK};
use crate::storage::BufferCache;
use crate::super_block::{Geometry, SuperBlock};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("block index {index} is beyond the triple-indirect range")]
    BlockIndexOutOfRange { index: usize },

    #[error("invalid inode number {ino} (filesystem has {inodes_count} inodes)")]
    InvalidInodeNumber { ino: InodeNumber, inodes_count: usize },
}

/// The pointers to follow from an inode to one of its logical blocks.
///
/// Each variant holds the offsets into the successive indirect blocks, outermost first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockPath {
    Direct(usize),
    Indirect([usize; 1]),
    Double([usize; 2]),
    Triple([usize; 3]),
}

impl BlockPath {
    /// Decomposes a logical block index for blocks holding `apb` pointers. Returns `None` past
    /// the triple-indirect range.
    pub fn new(index: usize, apb: usize) -> Option<BlockPath> {
        let mut index = index;

        if index < NUM_DIRECT {
            return Some(BlockPath::Direct(index));
        }
        index -= NUM_DIRECT;

        if index < apb {
            return Some(BlockPath::Indirect([index]));
        }
        index -= apb;

        let double = apb * apb;
        if index < double {
            return Some(BlockPath::Double([index / apb, index % apb]));
        }
        index -= double;

        if index < double * apb {
            return Some(BlockPath::Triple([
                index / double,
                index / apb % apb,
                index % apb,
            ]));
        }

        None
    }

    /// The index of the inode's block pointer the path starts from.
    pub fn slot(&self) -> usize {
        match self {
            BlockPath::Direct(index) => *index,
            BlockPath::Indirect(_) => IND_BLOCK,
            BlockPath::Double(_) => DIND_BLOCK,
            BlockPath::Triple(_) => TIND_BLOCK,
        }
    }

    /// Offsets into the indirect blocks, outermost first. Empty for direct blocks.
    pub fn offsets(&self) -> &[usize] {
        match self {
            BlockPath::Direct(_) => &[],
            BlockPath::Indirect(offsets) => offsets,
            BlockPath::Double(offsets) => offsets,
            BlockPath::Triple(offsets) => offsets,
        }
    }
}

/// Maps a logical block of `inode` to its physical block, or `None` if it is not allocated.
pub fn resolve_block(
    cache: &BufferCache,
    inode: &Inode,
    index: usize,
) -> Result<Option<BlockNumber>> {
    let apb = addr_per_block(cache.block_size());
    let path = BlockPath::new(index, apb).ok_or(ResolveError::BlockIndexOutOfRange { index })?;

    let mut block_number = inode.block[path.slot()] as BlockNumber;

    for offset in path.offsets() {
        if block_number == 0 {
            return Ok(None);
        }

        let indirect = cache
            .read(block_number)
            .with_context(|| format!("reading indirect block {block_number}"))?;
        block_number = read_pointer(&indirect, *offset);
    }

    Ok((block_number != 0).then_some(block_number))
}

/// Every allocated `(logical, physical)` block pair within the size of `inode`.
pub fn block_map(cache: &BufferCache, inode: &Inode) -> Result<Vec<(usize, BlockNumber)>> {
    let mut map = vec![];

    for index in 0..inode.size_in_blocks(cache.block_size()) {
        if let Some(block_number) = resolve_block(cache, inode, index)? {
            map.push((index, block_number));
        }
    }

    Ok(map)
}

/// Finds the inode table block holding inode `ino` and the record index within that block.
pub fn locate_inode_record(
    super_block: &SuperBlock,
    ino: InodeNumber,
) -> Result<(BlockNumber, usize)> {
    let geometry = super_block.geometry();

    if ino == 0 || ino as usize > geometry.inodes_count {
        return Err(ResolveError::InvalidInodeNumber {
            ino,
            inodes_count: geometry.inodes_count,
        }
        .into());
    }

    let group = (ino as usize - 1) / geometry.inodes_per_group;
    let local = (ino as usize - 1) % geometry.inodes_per_group;
    let block_number =
        super_block.descriptor(group).inode_table() + local / geometry.inodes_per_block;

    Ok((block_number, local % geometry.inodes_per_block))
}

/// The group a block belongs to.
pub fn group_of_block(geometry: &Geometry, block_number: BlockNumber) -> GroupNumber {
    assert!(block_number >= geometry.first_data_block);

    (block_number - geometry.first_data_block) / geometry.blocks_per_group
}

/// The blocks nominally covered by `group`. The last group may extend past the end of the
/// filesystem.
pub fn group_range(geometry: &Geometry, group: GroupNumber) -> RangeInclusive<BlockNumber> {
    let first = geometry.first_data_block + group * geometry.blocks_per_group;

    first..=first + geometry.blocks_per_group - 1
}
