//! Read-only consistency checks of a mounted filesystem.
//!
//! The checks compare the bitmaps with the group descriptors and the superblock, and in-core
//! inodes with their on-disk records. Findings are logged and returned; nothing is repaired.

use std::fmt;

use anyhow::{ensure, Result};
use log::{debug, warn};
use thiserror::Error;

use crate::disk_format::block::BlockNumber;
use crate::disk_format::group_descriptor::GroupNumber;
use crate::disk_format::inode::Inode;
use crate::inode_table::{InodeHandle, InodeKey};
use crate::resolver::{group_range, locate_inode_record};
use crate::super_block::SuperBlock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountKind {
    Block,
    Inode,
}

impl fmt::Display for CountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountKind::Block => write!(f, "block"),
            CountKind::Inode => write!(f, "inode"),
        }
    }
}

/// One finding of the checker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Inconsistency {
    #[error("group {group}: {what} block {block} is marked free")]
    MetadataBlockFree {
        group: GroupNumber,
        what: &'static str,
        block: BlockNumber,
    },

    #[error("group {group}: {what} block {block} is outside the group")]
    MetadataOutsideGroup {
        group: GroupNumber,
        what: &'static str,
        block: BlockNumber,
    },

    #[error("group {group}: {counted} free {kind}s in the bitmap, descriptor says {recorded}")]
    GroupFreeCount {
        group: GroupNumber,
        kind: CountKind,
        counted: usize,
        recorded: usize,
    },

    #[error("{counted} free {kind}s in the bitmaps, superblock says {recorded}")]
    SuperBlockFreeCount {
        kind: CountKind,
        counted: usize,
        recorded: usize,
    },

    #[error("group {group}: unable to read {kind} bitmap (block {block}): {reason}")]
    UnreadableBitmap {
        group: GroupNumber,
        kind: CountKind,
        block: BlockNumber,
        reason: String,
    },

    #[error("inode {key}: {field} is {in_core} in core but {on_disk} on disk")]
    InodeMismatch {
        key: InodeKey,
        field: &'static str,
        in_core: String,
        on_disk: String,
    },

    #[error("inode {key}: unable to read the on-disk record: {reason}")]
    UnreadableInode { key: InodeKey, reason: String },
}

/// Everything a full check found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub findings: Vec<Inconsistency>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "no inconsistencies found");
        }

        writeln!(f, "{} inconsistencies found:", self.findings.len())?;
        for finding in &self.findings {
            writeln!(f, "  {finding}")?;
        }

        Ok(())
    }
}

pub struct Checker<'m> {
    super_block: &'m SuperBlock,
}

impl<'m> Checker<'m> {
    pub fn new(super_block: &'m SuperBlock) -> Self {
        Self { super_block }
    }

    /// Runs the block bitmap, descriptor and inode bitmap checks.
    pub fn check_all(&self) -> Report {
        let mut findings = self.check_block_bitmap();
        findings.extend(self.check_descriptors());
        findings.extend(self.check_inode_bitmap());

        for finding in &findings {
            warn!("device {}: {finding}", self.super_block.dev());
        }
        debug!(
            "device {}: check finished with {} findings",
            self.super_block.dev(),
            findings.len()
        );

        Report { findings }
    }

    /// Checks that every group's metadata blocks are marked used and that the free block
    /// counts agree with the bitmaps.
    pub fn check_block_bitmap(&self) -> Vec<Inconsistency> {
        let geometry = self.super_block.geometry();
        let width = geometry.blocks_per_group / 8;
        let mut findings = Vec::new();
        let mut total = Some(0);

        for group in 0..geometry.groups_count {
            let range = group_range(geometry, group);
            let metadata = self.metadata_blocks(group);

            let read = self.super_block.with_block_bitmap(group, |bitmap| {
                let unmarked = metadata
                    .iter()
                    .filter(|(_, block)| range.contains(block))
                    .filter(|(_, block)| !bitmap.is_set(block - range.start()))
                    .copied()
                    .collect::<Vec<_>>();

                (bitmap.count_free(width), unmarked)
            });

            let (counted, unmarked) = match read {
                Ok(result) => result,
                Err(err) => {
                    findings.push(self.unreadable(group, CountKind::Block, err));
                    total = None;
                    continue;
                }
            };

            findings.extend(unmarked.into_iter().map(|(what, block)| {
                Inconsistency::MetadataBlockFree { group, what, block }
            }));

            let recorded = self.super_block.descriptor(group).free_blocks_count as usize;
            if counted != recorded {
                findings.push(Inconsistency::GroupFreeCount {
                    group,
                    kind: CountKind::Block,
                    counted,
                    recorded,
                });
            }

            total = total.map(|total| total + counted);
        }

        let recorded = self.super_block.disk().free_blocks_count as usize;
        if let Some(counted) = total.filter(|counted| *counted != recorded) {
            findings.push(Inconsistency::SuperBlockFreeCount {
                kind: CountKind::Block,
                counted,
                recorded,
            });
        }

        findings
    }

    /// Checks that each group's bitmaps and inode table lie inside the group.
    pub fn check_descriptors(&self) -> Vec<Inconsistency> {
        let geometry = self.super_block.geometry();
        let mut findings = Vec::new();

        for (group, descriptor) in self.super_block.descriptors().into_iter().enumerate() {
            let range = group_range(geometry, group);
            let inode_table = descriptor.inode_table();

            let placed = [
                ("block bitmap", descriptor.block_bitmap()),
                ("inode bitmap", descriptor.inode_bitmap()),
                ("inode table start", inode_table),
                (
                    "inode table end",
                    inode_table + geometry.inode_table_blocks - 1,
                ),
            ];

            for (what, block) in placed {
                if !range.contains(&block) || block >= geometry.blocks_count {
                    findings.push(Inconsistency::MetadataOutsideGroup { group, what, block });
                }
            }
        }

        findings
    }

    /// Checks the free inode counts of the descriptors and the superblock against the bitmaps.
    pub fn check_inode_bitmap(&self) -> Vec<Inconsistency> {
        let geometry = self.super_block.geometry();
        let width = geometry.inodes_per_group / 8;
        let mut findings = Vec::new();
        let mut total = Some(0);

        for group in 0..geometry.groups_count {
            let counted = match self
                .super_block
                .with_inode_bitmap(group, |bitmap| bitmap.count_free(width))
            {
                Ok(counted) => counted,
                Err(err) => {
                    findings.push(self.unreadable(group, CountKind::Inode, err));
                    total = None;
                    continue;
                }
            };

            let recorded = self.super_block.descriptor(group).free_inodes_count as usize;
            if counted != recorded {
                findings.push(Inconsistency::GroupFreeCount {
                    group,
                    kind: CountKind::Inode,
                    counted,
                    recorded,
                });
            }

            total = total.map(|total| total + counted);
        }

        let recorded = self.super_block.disk().free_inodes_count as usize;
        if let Some(counted) = total.filter(|counted| *counted != recorded) {
            findings.push(Inconsistency::SuperBlockFreeCount {
                kind: CountKind::Inode,
                counted,
                recorded,
            });
        }

        findings
    }

    /// Compares a clean in-core inode with its on-disk record.
    ///
    /// Dirty inodes and pipes are skipped: they are expected to differ.
    pub fn check_inode(&self, handle: &InodeHandle<'_>) -> Result<Vec<Inconsistency>> {
        let Some(key) = handle.key() else {
            return Ok(Vec::new());
        };
        ensure!(
            key.dev == self.super_block.dev(),
            "inode {key} does not belong to device {}",
            self.super_block.dev()
        );

        let in_core = handle.record();
        if handle.is_dirty() {
            return Ok(Vec::new());
        }

        let on_disk = match self.read_on_disk(key) {
            Ok(record) => record,
            Err(err) => {
                return Ok(vec![Inconsistency::UnreadableInode {
                    key,
                    reason: format!("{err:#}"),
                }])
            }
        };

        // the record may have been dirtied while it was read
        if handle.is_dirty() {
            return Ok(Vec::new());
        }

        let mut findings = Vec::new();
        macro_rules! compare {
            ($($field:ident),+ $(,)?) => {
                $(
                    if in_core.$field != on_disk.$field {
                        findings.push(Inconsistency::InodeMismatch {
                            key,
                            field: stringify!($field),
                            in_core: format!("{:?}", in_core.$field),
                            on_disk: format!("{:?}", on_disk.$field),
                        });
                    }
                )+
            };
        }
        compare!(
            mode, uid, size, atime, ctime, mtime, dtime, gid, links_count, blocks, flags, block,
            generation, file_acl, dir_acl, faddr,
        );

        for finding in &findings {
            warn!("{finding}");
        }

        Ok(findings)
    }

    fn read_on_disk(&self, key: InodeKey) -> Result<Inode> {
        let (block_number, index) = locate_inode_record(self.super_block, key.ino)?;
        let block = self.super_block.cache().read(block_number)?;

        Ok(Inode::decode_from_block(
            &block,
            index,
            self.super_block.geometry().inode_size,
        ))
    }

    /// The blocks of `group` that must always be marked used.
    fn metadata_blocks(&self, group: GroupNumber) -> Vec<(&'static str, BlockNumber)> {
        let geometry = self.super_block.geometry();
        let descriptor = self.super_block.descriptor(group);
        let start = *group_range(geometry, group).start();
        let mut blocks = Vec::new();

        if self.super_block.group_has_super_backup(group) {
            blocks.push(("superblock", start));
            blocks.extend((1..=geometry.desc_blocks).map(|i| ("descriptor table", start + i)));
        }

        blocks.push(("block bitmap", descriptor.block_bitmap()));
        blocks.push(("inode bitmap", descriptor.inode_bitmap()));
        blocks.extend(
            (0..geometry.inode_table_blocks).map(|i| ("inode table", descriptor.inode_table() + i)),
        );

        blocks
    }

    fn unreadable(&self, group: GroupNumber, kind: CountKind, err: anyhow::Error) -> Inconsistency {
        let descriptor = self.super_block.descriptor(group);
        let block = match kind {
            CountKind::Block => descriptor.block_bitmap(),
            CountKind::Inode => descriptor.inode_bitmap(),
        };

        Inconsistency::UnreadableBitmap {
            group,
            kind,
            block,
            reason: format!("{err:#}"),
        }
    }
}
