//! Name lookup in directories.

use anyhow::{ensure, Context, Result};

use crate::disk_format::directory_entry::DirectoryEntries;
use crate::disk_format::inode::{InodeNumber, ROOT_INODE};
use crate::inode_table::{InodeHandle, InodeTable};
use crate::resolver::resolve_block;

/// Looks `name` up in the directory `dir` and acquires the inode it names.
///
/// `..` from the root of a mounted filesystem leads to the parent of the directory it is
/// mounted on. A name naming a mount point leads into the mounted filesystem.
pub fn lookup<'t>(
    table: &'t InodeTable,
    dir: &InodeHandle<'t>,
    name: &[u8],
) -> Result<Option<InodeHandle<'t>>> {
    let key = dir.key().context("directory is not attached to a device")?;
    let record = dir.record();
    ensure!(record.is_directory(), "inode {key} is not a directory");

    if name == b"." {
        return Ok(Some(dir.clone()));
    }

    if name == b".." && key.ino == ROOT_INODE {
        if let Some(anchor) = table
            .mounts()
            .mount_for(key.dev)
            .and_then(|mount| mount.anchor_slot())
        {
            let anchor = table.reference(anchor);
            return lookup(table, &anchor, name);
        }
    }

    let mount = table
        .mounts()
        .mount_for(key.dev)
        .with_context(|| format!("device {} is not mounted", key.dev))?;
    let cache = mount.super_block().cache();

    let mut found: Option<InodeNumber> = None;
    for index in 0..record.size_in_blocks(cache.block_size()) {
        let Some(block_number) = resolve_block(cache, &record, index)? else {
            continue;
        };

        let block = cache.read(block_number)?;
        for entry in DirectoryEntries::new(&block) {
            let entry = entry.with_context(|| {
                format!("in block {block_number} of directory {key}")
            })?;

            if entry.is_used() && entry.name == name {
                found = Some(entry.header.inode);
                break;
            }
        }

        if found.is_some() {
            break;
        }
    }

    found
        .map(|ino| table.acquire(key.dev, ino))
        .transpose()
}

/// Walks `path` component by component from `root`. Empty components are skipped.
pub fn resolve_path<'t>(
    table: &'t InodeTable,
    root: &InodeHandle<'t>,
    path: &str,
) -> Result<InodeHandle<'t>> {
    let mut current = root.clone();

    for component in path.split('/').filter(|component| !component.is_empty()) {
        ensure!(
            current.record().is_directory(),
            "not a directory on the way to {component}"
        );

        current = lookup(table, &current, component.as_bytes())?
            .with_context(|| format!("no such file or directory: {component}"))?;
    }

    Ok(current)
}
