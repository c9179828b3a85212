use std::mem::size_of;

use serde::{Deserialize, Serialize};

use super::block::BlockNumber;

/// Block group numbers are zero-indexed.
pub type GroupNumber = usize;

/// The number of bytes occupied by a group descriptor.
pub const GROUP_DESCRIPTOR_SIZE: usize = 32;
const_assert!(size_of::<GroupDescriptor>() == GROUP_DESCRIPTOR_SIZE);

/// A block group descriptor.
///
/// The descriptor table starts in the block following the superblock and holds one descriptor
/// per block group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct GroupDescriptor {
    /// Block number of the group's block bitmap.
    pub block_bitmap: u32,
    /// Block number of the group's inode bitmap.
    pub inode_bitmap: u32,
    /// Block number of the first block of the group's inode table.
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub pad: u16,
    pub reserved: [u8; 12],
}

impl GroupDescriptor {
    pub fn block_bitmap(&self) -> BlockNumber {
        self.block_bitmap as BlockNumber
    }

    pub fn inode_bitmap(&self) -> BlockNumber {
        self.inode_bitmap as BlockNumber
    }

    pub fn inode_table(&self) -> BlockNumber {
        self.inode_table as BlockNumber
    }

    /// Decodes every descriptor stored in one descriptor table block.
    pub fn decode_block(block: &[u8]) -> Vec<GroupDescriptor> {
        block
            .chunks_exact(GROUP_DESCRIPTOR_SIZE)
            .map(|chunk| {
                bincode::deserialize(chunk)
                    .expect("GROUP_DESCRIPTOR_SIZE bytes always hold a descriptor")
            })
            .collect()
    }

    /// Writes this descriptor into the `index`th slot of a descriptor table block.
    pub fn encode_into_block(&self, block: &mut [u8], index: usize) {
        let encoded = bincode::serialize(self).expect("serializing fixed-size integers cannot fail");
        let offset = index * GROUP_DESCRIPTOR_SIZE;

        block[offset..offset + GROUP_DESCRIPTOR_SIZE].copy_from_slice(&encoded);
    }
}
