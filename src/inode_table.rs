//! The in-core inode table.
//!
//! A fixed number of slots caches inode records between the callers and the block device. A
//! slot is identified by its `(device, inode number)` key while it is referenced, and keeps its
//! contents once the last reference goes away so that the next acquisition of the same inode is
//! a hit. Every slot state change happens under a single table mutex; disk I/O happens outside
//! it while the slot is marked locked, and anybody needing a locked slot waits on the table's
//! condition variable.

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::disk_format::inode::{FileKind, Inode, InodeNumber, ROOT_INODE, S_IFIFO};
use crate::error::Fatal;
use crate::mount::{DeviceId, Mount, MountTable};
use crate::resolver::locate_inode_record;
use crate::truncate::{free_inode, truncate};

/// The size of the anonymous page backing a pipe.
pub const PIPE_PAGE_SIZE: usize = 4096;

/// Identifies an on-disk inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: DeviceId,
    pub ino: InodeNumber,
}

impl fmt::Display for InodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[derive(Default)]
struct Slot {
    /// `None` for free slots, pipes and inodes of removed devices.
    key: Option<InodeKey>,
    count: usize,
    dirty: bool,
    /// Bumped on every modification, so that a write-back only cleans the state it wrote.
    generation: u64,
    /// A load or store is in flight.
    locked: bool,
    /// Another filesystem is mounted on this inode.
    mounted: bool,
    pipe: Option<Box<[u8]>>,
    record: Inode,
}

struct TableState {
    slots: Vec<Slot>,
    /// Where the next search for a free slot starts.
    cursor: usize,
}

enum Victim {
    Free(usize),
    /// The only candidates are locked; wait for them.
    Locked,
    /// The only candidates are dirty; write this one back and retry.
    Dirty(usize),
    Exhausted,
}

impl TableState {
    fn find(&self, key: InodeKey) -> Option<usize> {
        self.slots.iter().position(|slot| slot.key == Some(key))
    }

    /// Scans the slots cyclically from the cursor for an unreferenced one, preferring slots that
    /// are neither dirty nor locked.
    fn pick_victim(&self) -> Victim {
        let len = self.slots.len();
        let mut fallback = None;

        for idx in (0..len).map(|i| (self.cursor + i) % len) {
            let slot = &self.slots[idx];
            if slot.count > 0 {
                continue;
            }

            if !slot.dirty && !slot.locked {
                return Victim::Free(idx);
            }

            fallback.get_or_insert(idx);
        }

        match fallback {
            Some(idx) if self.slots[idx].locked => Victim::Locked,
            Some(idx) => Victim::Dirty(idx),
            None => Victim::Exhausted,
        }
    }
}

/// Slot usage, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub capacity: usize,
    /// Slots with at least one reference.
    pub in_use: usize,
    pub dirty: usize,
    pub locked: usize,
    pub pipes: usize,
}

pub struct InodeTable {
    state: Mutex<TableState>,
    unlocked: Condvar,
    mounts: MountTable,
    config: Config,
}

impl InodeTable {
    pub fn new(config: Config) -> Self {
        assert!(config.inode_table_capacity > 0, "inode table needs at least one slot");

        let slots = (0..config.inode_table_capacity)
            .map(|_| Slot::default())
            .collect();

        Self {
            state: Mutex::new(TableState { slots, cursor: 0 }),
            unlocked: Condvar::new(),
            mounts: MountTable::default(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Takes a reference to inode `ino` of `dev`, reading it from the device if it is not cached.
    ///
    /// Acquiring an inode another filesystem is mounted on yields the root inode of that
    /// filesystem instead.
    ///
    /// # Panics
    ///
    /// Panics if `dev` is [`DeviceId::NONE`].
    pub fn acquire(&self, dev: DeviceId, ino: InodeNumber) -> Result<InodeHandle<'_>> {
        assert!(dev != DeviceId::NONE, "acquire: no device");

        let mut key = InodeKey { dev, ino };
        let mut state = self.lock();

        loop {
            if let Some(idx) = state.find(key) {
                if state.slots[idx].locked {
                    state = self.wait(state);
                    continue;
                }

                if state.slots[idx].mounted {
                    match self.mounts.mount_on_anchor(key) {
                        Some(mount) => {
                            debug!("crossing mount point {key} into device {}", mount.dev());
                            key = InodeKey {
                                dev: mount.dev(),
                                ino: ROOT_INODE,
                            };
                            continue;
                        }
                        None => warn!("mount point {key} has no mounted filesystem"),
                    }
                }

                state.slots[idx].count += 1;
                return Ok(InodeHandle { table: self, slot: idx });
            }

            let Some(mount) = self.mounts.mount_for(key.dev) else {
                return Err(Fatal::NoSuperBlock(key.dev).into());
            };

            let idx = match state.pick_victim() {
                Victim::Free(idx) => idx,
                Victim::Locked => {
                    state = self.wait(state);
                    continue;
                }
                Victim::Dirty(idx) => {
                    drop(state);
                    self.write_back(idx)?;
                    state = self.lock();
                    continue;
                }
                Victim::Exhausted => {
                    self.log_exhaustion(&state);
                    return Err(Fatal::InodeTableExhausted {
                        capacity: state.slots.len(),
                    }
                    .into());
                }
            };

            state.cursor = (idx + 1) % state.slots.len();
            state.slots[idx] = Slot {
                key: Some(key),
                count: 1,
                ..Slot::default()
            };
            let slot_lock = self.lock_slot(&mut state, idx, |slot| *slot = Slot::default());
            drop(state);

            let loaded = self.read_record(&mount, key.ino);

            return slot_lock.finish(|slot| match loaded {
                Ok(record) => {
                    slot.record = record;
                    Ok(InodeHandle { table: self, slot: idx })
                }
                Err(err) => {
                    *slot = Slot::default();
                    Err(err)
                }
            });
        }
    }

    /// Creates an anonymous pipe inode backed by a zeroed page.
    pub fn acquire_pipe(&self) -> Result<InodeHandle<'_>> {
        let mut state = self.lock();

        loop {
            let idx = match state.pick_victim() {
                Victim::Free(idx) => idx,
                Victim::Locked => {
                    state = self.wait(state);
                    continue;
                }
                Victim::Dirty(idx) => {
                    drop(state);
                    self.write_back(idx)?;
                    state = self.lock();
                    continue;
                }
                Victim::Exhausted => {
                    self.log_exhaustion(&state);
                    return Err(Fatal::InodeTableExhausted {
                        capacity: state.slots.len(),
                    }
                    .into());
                }
            };

            state.cursor = (idx + 1) % state.slots.len();
            state.slots[idx] = Slot {
                count: 1,
                pipe: Some(vec![0; PIPE_PAGE_SIZE].into_boxed_slice()),
                record: Inode {
                    mode: S_IFIFO | 0o600,
                    links_count: 1,
                    ..Inode::default()
                },
                ..Slot::default()
            };

            return Ok(InodeHandle { table: self, slot: idx });
        }
    }

    /// Drops one reference to the inode in `idx`.
    ///
    /// The last reference to an inode without links frees its blocks and the inode itself. The
    /// last reference to a dirty inode writes it back first.
    fn release(&self, idx: usize) -> Result<()> {
        self.sync_named_device(idx)?;

        let mut state = self.lock();
        loop {
            while state.slots[idx].locked {
                state = self.wait(state);
            }

            let slot = &mut state.slots[idx];
            assert!(slot.count > 0, "iput: trying to free free inode");

            if slot.pipe.is_some() {
                slot.count -= 1;
                if slot.count == 0 {
                    *slot = Slot::default();
                }
                return Ok(());
            }

            let Some(key) = slot.key else {
                slot.count -= 1;
                return Ok(());
            };

            if slot.count > 1 {
                slot.count -= 1;
                return Ok(());
            }

            if slot.record.links_count == 0 {
                let record = slot.record;
                let slot_lock = self.lock_slot(&mut state, idx, |slot| slot.count -= 1);
                drop(state);

                let reclaimed = self.reclaim(key, record);
                slot_lock.finish(|slot| match &reclaimed {
                    Ok(()) => *slot = Slot::default(),
                    Err(_) => slot.count -= 1,
                });

                return reclaimed;
            }

            if slot.dirty {
                drop(state);
                let written = self.write_back(idx);
                state = self.lock();

                if let Err(err) = written {
                    state.slots[idx].count -= 1;
                    return Err(err);
                }
                continue;
            }

            slot.count -= 1;
            return Ok(());
        }
    }

    /// Releasing a block device inode flushes the device it refers to.
    fn sync_named_device(&self, idx: usize) -> Result<()> {
        let record = self.lock().slots[idx].record;
        if record.kind() != FileKind::BlockDevice {
            return Ok(());
        }

        let target = DeviceId(record.block[0] as u16);
        if self.mounts.mount_for(target).is_some() {
            self.sync_device(target)?;
        }

        Ok(())
    }

    /// Frees the blocks and the inode number of an inode whose last link is gone.
    fn reclaim(&self, key: InodeKey, mut record: Inode) -> Result<()> {
        let mount = self
            .mounts
            .mount_for(key.dev)
            .ok_or(Fatal::NoSuperBlock(key.dev))?;
        let super_block = mount.super_block();
        let was_directory = record.is_directory();

        debug!("freeing inode {key}");

        truncate(super_block, &mut record).with_context(|| format!("truncating inode {key}"))?;
        record.dtime = unix_time();
        self.store_record(&mount, key.ino, &record)?;
        free_inode(super_block, key.ino, was_directory)
    }

    /// Writes the inode in `idx` to its device if it is dirty.
    pub(crate) fn write_back(&self, idx: usize) -> Result<()> {
        let mut state = self.lock();
        while state.slots[idx].locked {
            state = self.wait(state);
        }

        let slot = &mut state.slots[idx];
        // pipe pages never reach a device
        if !slot.dirty || slot.pipe.is_some() {
            return Ok(());
        }

        let Some(key) = slot.key else {
            slot.dirty = false;
            return Ok(());
        };

        let generation = slot.generation;
        let record = slot.record;
        let slot_lock = self.lock_slot(&mut state, idx, |_| {});
        drop(state);

        let written = match self.mounts.mount_for(key.dev) {
            Some(mount) => self.store_record(&mount, key.ino, &record),
            None => Err(Fatal::NoSuperBlock(key.dev).into()),
        };

        slot_lock.finish(|slot| {
            if written.is_ok() && slot.generation == generation {
                slot.dirty = false;
            }
        });

        written
    }

    fn read_record(&self, mount: &Mount, ino: InodeNumber) -> Result<Inode> {
        let super_block = mount.super_block();
        let (block_number, index) = locate_inode_record(super_block, ino)?;

        let buffer = super_block
            .cache()
            .read(block_number)
            .context(Fatal::MetadataUnreadable {
                dev: mount.dev(),
                what: "inode table",
                block: block_number,
            })?;

        Ok(Inode::decode_from_block(
            &buffer,
            index,
            super_block.geometry().inode_size,
        ))
    }

    fn store_record(&self, mount: &Mount, ino: InodeNumber, record: &Inode) -> Result<()> {
        let super_block = mount.super_block();
        let (block_number, index) = locate_inode_record(super_block, ino)?;

        let mut buffer = super_block
            .cache()
            .read(block_number)
            .context(Fatal::MetadataUnreadable {
                dev: mount.dev(),
                what: "inode table",
                block: block_number,
            })?;
        record.encode_into_block(&mut buffer, index, super_block.geometry().inode_size);
        buffer.mark_dirty();

        Ok(())
    }

    /// Writes back every dirty inode.
    pub fn sync_all(&self) -> Result<()> {
        let len = self.lock().slots.len();
        for idx in 0..len {
            self.write_back(idx)?;
        }

        Ok(())
    }

    /// Writes back the dirty inodes of `dev`.
    pub(crate) fn write_back_device(&self, dev: DeviceId) -> Result<()> {
        let dirty = self
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.dirty && slot.key.is_some_and(|key| key.dev == dev))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        for idx in dirty {
            self.write_back(idx)?;
        }

        Ok(())
    }

    /// Forgets every cached inode of a removed device.
    ///
    /// Inodes that are still referenced stay alive for their holders but are detached from the
    /// device: they are never written back.
    pub fn invalidate_device(&self, dev: DeviceId) {
        let mut state = self.lock();

        for idx in 0..state.slots.len() {
            while state.slots[idx].locked {
                state = self.wait(state);
            }

            let slot = &mut state.slots[idx];
            let Some(key) = slot.key.filter(|key| key.dev == dev) else {
                continue;
            };

            if slot.count > 0 {
                warn!("inode {key} in use on removed device");
                slot.key = None;
                slot.dirty = false;
            } else {
                *slot = Slot::default();
            }
        }
    }

    /// Whether any inode of `dev` is referenced.
    pub fn is_device_busy(&self, dev: DeviceId) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|slot| slot.count > 0 && slot.key.is_some_and(|key| key.dev == dev))
    }

    pub fn stats(&self) -> TableStats {
        let state = self.lock();
        let mut stats = TableStats {
            capacity: state.slots.len(),
            ..TableStats::default()
        };

        for slot in &state.slots {
            stats.in_use += (slot.count > 0) as usize;
            stats.dirty += slot.dirty as usize;
            stats.locked += slot.locked as usize;
            stats.pipes += slot.pipe.is_some() as usize;
        }

        stats
    }

    /// Marks the inode in `idx` as a mount point. Returns `false` if it already is one.
    pub(crate) fn claim_mount_point(&self, idx: usize) -> bool {
        let mut state = self.lock();
        let slot = &mut state.slots[idx];

        !std::mem::replace(&mut slot.mounted, true)
    }

    pub(crate) fn clear_mount_point(&self, idx: usize) {
        self.lock().slots[idx].mounted = false;
    }

    /// Takes another reference to the inode in `idx`, which must already be referenced.
    pub(crate) fn reference(&self, idx: usize) -> InodeHandle<'_> {
        let mut state = self.lock();
        assert!(state.slots[idx].count > 0, "referencing a free inode slot");
        state.slots[idx].count += 1;

        InodeHandle { table: self, slot: idx }
    }

    /// Marks the slot `idx` as having a load or store in flight. `state` is this table's state.
    fn lock_slot(
        &self,
        state: &mut TableState,
        idx: usize,
        abort: fn(&mut Slot),
    ) -> SlotLock<'_> {
        state.slots[idx].locked = true;

        SlotLock {
            table: self,
            idx,
            abort,
        }
    }

    fn unlock_slot<R>(&self, idx: usize, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut state = self.lock();
        let slot = &mut state.slots[idx];
        let result = f(slot);
        slot.locked = false;
        drop(state);
        self.unlocked.notify_all();

        result
    }

    fn log_exhaustion(&self, state: &TableState) {
        error!("no free inodes in memory ({} slots)", state.slots.len());
        for (idx, slot) in state.slots.iter().enumerate() {
            match slot.key {
                Some(key) => info!(
                    "slot {idx}: inode {key}, mode {:o}, count {}",
                    slot.record.mode, slot.count
                ),
                None if slot.pipe.is_some() => info!("slot {idx}: pipe, count {}", slot.count),
                None => info!("slot {idx}: detached, count {}", slot.count),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, state: MutexGuard<'a, TableState>) -> MutexGuard<'a, TableState> {
        self.unlocked
            .wait(state)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A slot marked locked while its I/O runs outside the table mutex.
///
/// Dropping the guard without calling [`SlotLock::finish`], which only happens while unwinding,
/// applies `abort` to the slot before unlocking it, so that waiters are never left hanging.
struct SlotLock<'t> {
    table: &'t InodeTable,
    idx: usize,
    abort: fn(&mut Slot),
}

impl SlotLock<'_> {
    /// Runs `f` on the slot, then unlocks it and wakes the waiters.
    fn finish<R>(self, f: impl FnOnce(&mut Slot) -> R) -> R {
        let slot_lock = ManuallyDrop::new(self);
        slot_lock.table.unlock_slot(slot_lock.idx, f)
    }
}

impl Drop for SlotLock<'_> {
    fn drop(&mut self) {
        self.table.unlock_slot(self.idx, self.abort);
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

/// One reference to an in-core inode. Dropping the handle releases the reference.
pub struct InodeHandle<'t> {
    table: &'t InodeTable,
    slot: usize,
}

impl<'t> InodeHandle<'t> {
    pub fn table(&self) -> &'t InodeTable {
        self.table
    }

    /// `None` for pipes and for inodes of removed devices.
    pub fn key(&self) -> Option<InodeKey> {
        self.table.lock().slots[self.slot].key
    }

    pub fn count(&self) -> usize {
        self.table.lock().slots[self.slot].count
    }

    pub fn is_dirty(&self) -> bool {
        self.table.lock().slots[self.slot].dirty
    }

    pub fn is_pipe(&self) -> bool {
        self.table.lock().slots[self.slot].pipe.is_some()
    }

    /// A copy of the in-core record.
    pub fn record(&self) -> Inode {
        self.table.lock().slots[self.slot].record
    }

    /// Modifies the in-core record and marks it dirty.
    ///
    /// `f` runs under the table lock and must not use the table.
    pub fn update<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut state = self.table.lock();
        let slot = &mut state.slots[self.slot];
        slot.dirty = true;
        slot.generation += 1;

        f(&mut slot.record)
    }

    /// Runs `f` on the page of a pipe inode. Returns `None` for other inodes.
    pub fn with_pipe_page<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut state = self.table.lock();
        state.slots[self.slot].pipe.as_deref_mut().map(f)
    }

    /// Releases the reference, reporting failures of the write-back or of freeing the inode.
    pub fn put(self) -> Result<()> {
        let handle = ManuallyDrop::new(self);
        handle.table.release(handle.slot)
    }

    /// Gives up the handle without releasing its reference.
    pub(crate) fn into_raw(self) -> usize {
        ManuallyDrop::new(self).slot
    }

    /// Takes back a reference given up with [`InodeHandle::into_raw`].
    pub(crate) fn from_raw(table: &'t InodeTable, slot: usize) -> Self {
        Self { table, slot }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
}

impl Clone for InodeHandle<'_> {
    fn clone(&self) -> Self {
        self.table.reference(self.slot)
    }
}

impl fmt::Debug for InodeHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeHandle")
            .field("slot", &self.slot)
            .field("key", &self.key())
            .finish()
    }
}

impl Drop for InodeHandle<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.table.release(self.slot) {
            error!("releasing inode: {err:#}");
        }
    }
}
