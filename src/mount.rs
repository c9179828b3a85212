//! Mounted filesystems.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{ensure, Context, Result};
use log::info;

use crate::disk_format::inode::ROOT_INODE;
use crate::inode_table::{InodeHandle, InodeKey, InodeTable};
use crate::storage::BlockDevice;
use crate::super_block::SuperBlock;

/// A device number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u16);

impl DeviceId {
    /// "No device".
    pub const NONE: DeviceId = DeviceId(0);
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// A filesystem mounted on a device.
pub struct Mount {
    super_block: SuperBlock,
    /// The inode this filesystem is mounted on and its pinned slot, unless it is the root
    /// filesystem.
    anchor: Option<(InodeKey, usize)>,
}

impl Mount {
    pub fn dev(&self) -> DeviceId {
        self.super_block.dev()
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn anchor(&self) -> Option<InodeKey> {
        self.anchor.map(|(key, _)| key)
    }

    pub(crate) fn anchor_slot(&self) -> Option<usize> {
        self.anchor.map(|(_, slot)| slot)
    }
}

/// The mounted filesystems, by device.
#[derive(Default)]
pub struct MountTable {
    mounts: RwLock<Vec<Arc<Mount>>>,
}

impl MountTable {
    pub fn mount_for(&self, dev: DeviceId) -> Option<Arc<Mount>> {
        self.read().iter().find(|mount| mount.dev() == dev).cloned()
    }

    /// The filesystem mounted on the inode `key`.
    pub fn mount_on_anchor(&self, key: InodeKey) -> Option<Arc<Mount>> {
        self.read()
            .iter()
            .find(|mount| mount.anchor() == Some(key))
            .cloned()
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.read().iter().map(|mount| mount.dev()).collect()
    }

    fn has_children(&self, dev: DeviceId) -> bool {
        self.read()
            .iter()
            .any(|mount| mount.anchor().is_some_and(|key| key.dev == dev))
    }

    /// Adds `mount` unless its device is already mounted.
    fn insert(&self, mount: Mount) -> Result<()> {
        let mut mounts = self.write();
        let dev = mount.dev();
        ensure!(
            mounts.iter().all(|mounted| mounted.dev() != dev),
            "device {dev} is already mounted"
        );
        mounts.push(Arc::new(mount));

        Ok(())
    }

    fn remove(&self, dev: DeviceId) -> Option<Arc<Mount>> {
        let mut mounts = self.write();
        let position = mounts.iter().position(|mount| mount.dev() == dev)?;

        Some(mounts.remove(position))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Mount>>> {
        self.mounts.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Mount>>> {
        self.mounts.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InodeTable {
    /// Mounts the filesystem on `device` as `dev`.
    ///
    /// Without an anchor this is the root filesystem. Otherwise the anchor must be a directory
    /// that is neither a mount point already nor the root of its own filesystem; it stays
    /// referenced until the filesystem is unmounted.
    pub fn mount<'t>(
        &'t self,
        dev: DeviceId,
        device: Arc<dyn BlockDevice>,
        anchor: Option<InodeHandle<'t>>,
    ) -> Result<()> {
        ensure!(dev != DeviceId::NONE, "cannot mount without a device number");
        ensure!(
            self.mounts().mount_for(dev).is_none(),
            "device {dev} is already mounted"
        );

        let anchor = match anchor {
            None => None,
            Some(handle) => {
                ensure!(
                    std::ptr::eq(handle.table(), self),
                    "mount point belongs to another inode table"
                );
                let key = handle
                    .key()
                    .context("mount point is not attached to a device")?;

                ensure!(
                    handle.record().is_directory(),
                    "mount point {key} is not a directory"
                );
                ensure!(
                    key.ino != ROOT_INODE,
                    "mount point {key} is the root of its filesystem"
                );
                ensure!(
                    self.claim_mount_point(handle.slot()),
                    "{key} is already a mount point"
                );

                Some((key, handle))
            }
        };

        let mounted = SuperBlock::load(dev, device, self.config()).and_then(|super_block| {
            let disk = super_block.disk();
            self.mounts().insert(Mount {
                super_block,
                anchor: anchor.as_ref().map(|(key, handle)| (*key, handle.slot())),
            })?;

            Ok(disk)
        });

        let disk = match mounted {
            Ok(disk) => disk,
            Err(err) => {
                if let Some((_, handle)) = &anchor {
                    self.clear_mount_point(handle.slot());
                }
                return Err(err);
            }
        };

        match anchor {
            Some((key, handle)) => {
                handle.into_raw();
                info!("mounted device {dev} on {key}");
            }
            None => info!("mounted device {dev} as root"),
        }
        info!(
            "device {dev}: {} free blocks, {} free inodes",
            disk.free_blocks_count, disk.free_inodes_count
        );

        Ok(())
    }

    /// Writes back everything cached for `dev` and removes the filesystem.
    ///
    /// Fails while inodes of the filesystem are referenced or other filesystems are mounted on
    /// it.
    pub fn unmount(&self, dev: DeviceId) -> Result<()> {
        let mount = self
            .mounts()
            .mount_for(dev)
            .with_context(|| format!("device {dev} is not mounted"))?;

        ensure!(
            !self.mounts().has_children(dev),
            "device {dev} is busy: other filesystems are mounted on it"
        );
        ensure!(!self.is_device_busy(dev), "device {dev} is busy: inodes in use");

        self.sync_device(dev)?;
        self.invalidate_device(dev);
        self.mounts().remove(dev);

        if let Some(slot) = mount.anchor_slot() {
            self.clear_mount_point(slot);
            InodeHandle::from_raw(self, slot).put()?;
        }

        info!("unmounted device {dev}");

        Ok(())
    }

    /// Writes the dirty inodes, bitmaps, descriptors and superblock of `dev` to the device.
    pub fn sync_device(&self, dev: DeviceId) -> Result<()> {
        let mount = self
            .mounts()
            .mount_for(dev)
            .with_context(|| format!("device {dev} is not mounted"))?;

        self.write_back_device(dev)?;
        mount.super_block().sync()
    }
}
