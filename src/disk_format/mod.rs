//! Constants and structures that define the ext2 disk format.
//!
//! Every structure is stored little endian. The codecs go through `bincode`'s default (fixed-int,
//! little-endian) encoding, so field order in the structs below *is* the on-disk layout.

/// Perform a const assertion.
macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

/// Block numbers and block size arithmetic.
pub mod block;
/// Directory entries.
pub mod directory_entry;
/// Block group descriptors.
pub mod group_descriptor;
/// Inodes.
pub mod inode;
/// The superblock.
pub mod super_block;
