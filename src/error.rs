//! Errors the caller cannot recover from.
//!
//! Recoverable failures travel as plain [`anyhow::Error`]s. The conditions below are wrapped in
//! an [`anyhow::Error`] too, but the caller is expected to treat them as terminal: check with
//! [`is_fatal`] and stop using the filesystem. Violated programming invariants panic instead.

use thiserror::Error;

use crate::disk_format::block::BlockNumber;
use crate::mount::DeviceId;

#[derive(Debug, Error)]
pub enum Fatal {
    /// Every slot of the in-core inode table is referenced.
    #[error("no free inodes in memory: all {capacity} inode table slots are in use")]
    InodeTableExhausted { capacity: usize },

    /// A block that must be readable for the filesystem to work could not be read.
    #[error("unable to read {what} (block {block}) on device {dev}")]
    MetadataUnreadable {
        dev: DeviceId,
        what: &'static str,
        block: BlockNumber,
    },

    /// An inode refers to a device without a mounted superblock.
    #[error("no superblock for device {0}")]
    NoSuperBlock(DeviceId),
}

/// Whether `err` carries a [`Fatal`] condition anywhere in its context chain.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Fatal>()) || err.downcast_ref::<Fatal>().is_some()
}
