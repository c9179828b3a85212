use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::block::SUPER_BLOCK_SIZE;

/// `s_magic` of every ext2 filesystem.
pub const EXT2_MAGIC: u16 = 0xef53;

/// The number of leading superblock bytes this crate decodes. The rest of the
/// [`SUPER_BLOCK_SIZE`]-byte record is preserved as-is when the superblock is written back.
pub const SUPER_BLOCK_ENCODED_SIZE: usize = 104;
const_assert!(SUPER_BLOCK_ENCODED_SIZE <= SUPER_BLOCK_SIZE);

/// `s_rev_level` of filesystems with fixed inode sizes.
pub const GOOD_OLD_REV: u32 = 0;
/// `s_rev_level` of filesystems with a dynamic inode size and feature flags.
pub const DYNAMIC_REV: u32 = 1;

/// Read-only compatible feature: superblock backups only in groups 0, 1 and powers of 3, 5, 7.
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;

/// The superblock, as stored at byte 1024 of the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct DiskSuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    /// Blocks reserved for the superuser.
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    /// The block holding the superblock: 1 for 1 KiB blocks, 0 otherwise.
    pub first_data_block: u32,
    /// Block size is `1024 << log_block_size`.
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    /// Last mount time.
    pub mtime: u32,
    /// Last write time.
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: i16,
    pub magic: u16,
    pub state: FsState,
    pub errors: ErrorPolicy,
    pub minor_rev_level: u16,
    /// Time of last check.
    pub lastcheck: u32,
    /// Max. time between checks.
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    // the fields below are only meaningful for DYNAMIC_REV filesystems
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

/// `s_state`: whether the filesystem was cleanly unmounted and whether errors were detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum FsState {
    /// Mounted, or not cleanly unmounted.
    NotClean = 0,
    Valid = 1,
    Errors = 2,
    ValidWithErrors = 3,
}

/// `s_errors`: what the kernel should do when it detects an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum ErrorPolicy {
    Unspecified = 0,
    Continue = 1,
    RemountReadOnly = 2,
    Panic = 3,
}

impl DiskSuperBlock {
    /// Decodes the superblock from the [`SUPER_BLOCK_SIZE`] bytes read at its device offset.
    pub fn decode(bytes: &[u8]) -> Result<DiskSuperBlock> {
        bincode::deserialize(&bytes[..SUPER_BLOCK_ENCODED_SIZE]).context("parsing superblock")
    }

    /// Overwrites the decoded prefix of the raw superblock bytes.
    pub fn encode_into(&self, bytes: &mut [u8]) {
        let encoded = bincode::serialize(self).expect("serializing fixed-size integers cannot fail");
        bytes[..SUPER_BLOCK_ENCODED_SIZE].copy_from_slice(&encoded);
    }

    pub fn has_sparse_super(&self) -> bool {
        self.rev_level >= DYNAMIC_REV && self.feature_ro_compat & FEATURE_RO_COMPAT_SPARSE_SUPER != 0
    }
}
