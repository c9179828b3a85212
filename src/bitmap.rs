//! Block and inode bitmaps of the block groups, and the per-mount cache holding them.

use anyhow::{Context, Result};
use bitvec::{order::Lsb0, view::BitView};
use log::debug;

use crate::disk_format::block::BlockNumber;
use crate::disk_format::group_descriptor::GroupNumber;
use crate::storage::BufferCache;

/// The number of zero bits in each nibble value.
const NIBBLE_ZEROS: [u8; 16] = [4, 3, 3, 2, 3, 2, 2, 1, 3, 2, 2, 1, 2, 1, 1, 0];

/// Counts the zero (free) bits in the first `width` bytes of a bitmap.
pub fn count_free(bitmap: &[u8], width: usize) -> usize {
    bitmap[..width]
        .iter()
        .map(|byte| {
            (NIBBLE_ZEROS[(byte & 0xf) as usize] + NIBBLE_ZEROS[(byte >> 4) as usize]) as usize
        })
        .sum()
}

/// Where bitmaps are read from and written back to.
pub trait BitmapSource {
    fn read_bitmap(&self, block_number: BlockNumber) -> Result<Vec<u8>>;

    fn write_bitmap(&self, block_number: BlockNumber, data: &[u8]) -> Result<()>;
}

impl BitmapSource for BufferCache {
    fn read_bitmap(&self, block_number: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.read(block_number)?.to_vec())
    }

    fn write_bitmap(&self, block_number: BlockNumber, data: &[u8]) -> Result<()> {
        let mut buffer = self.read(block_number)?;
        buffer.copy_from_slice(data);
        buffer.mark_dirty();

        Ok(())
    }
}

/// One loaded bitmap block. A set bit means "in use".
#[derive(Debug)]
pub struct Bitmap {
    group: GroupNumber,
    block_number: BlockNumber,
    data: Vec<u8>,
    dirty: bool,
}

impl Bitmap {
    fn read(
        group: GroupNumber,
        block_number: BlockNumber,
        source: &dyn BitmapSource,
    ) -> Result<Self> {
        let data = source
            .read_bitmap(block_number)
            .with_context(|| format!("reading bitmap of group {group} (block {block_number})"))?;

        Ok(Self {
            group,
            block_number,
            data,
            dirty: false,
        })
    }

    fn write_back(&mut self, source: &dyn BitmapSource) -> Result<()> {
        if self.dirty {
            source
                .write_bitmap(self.block_number, &self.data)
                .with_context(|| format!("writing bitmap of group {}", self.group))?;
            self.dirty = false;
        }

        Ok(())
    }

    pub fn group(&self) -> GroupNumber {
        self.group
    }

    pub fn block_number(&self) -> BlockNumber {
        self.block_number
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.data.view_bits::<Lsb0>()[bit]
    }

    /// Marks `bit` as in use, returning whether it already was.
    pub fn set(&mut self, bit: usize) -> bool {
        self.replace(bit, true)
    }

    /// Marks `bit` as free, returning whether it was in use.
    pub fn clear(&mut self, bit: usize) -> bool {
        self.replace(bit, false)
    }

    /// Counts the free bits in the first `width` bytes.
    pub fn count_free(&self, width: usize) -> usize {
        count_free(&self.data, width)
    }

    fn replace(&mut self, bit: usize, value: bool) -> bool {
        let previous = self.data.view_bits_mut::<Lsb0>().replace(bit, value);
        if previous != value {
            self.dirty = true;
        }

        previous
    }
}

/// A bounded set of loaded bitmaps of one kind (block or inode) for one filesystem.
///
/// When every group fits, bitmaps are kept in a slot per group for the lifetime of the mount.
/// Otherwise the cache is ordered most recently used first and a miss evicts the last entry,
/// writing it back if it is dirty.
pub struct BitmapCache {
    kind: &'static str,
    groups_count: usize,
    entries: Entries,
}

enum Entries {
    Direct(Vec<Option<Bitmap>>),
    Lru { capacity: usize, bitmaps: Vec<Bitmap> },
}

impl BitmapCache {
    pub fn new(kind: &'static str, groups_count: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "bitmap cache needs at least one slot");

        let entries = if groups_count <= capacity {
            Entries::Direct((0..groups_count).map(|_| None).collect())
        } else {
            Entries::Lru {
                capacity,
                bitmaps: Vec::with_capacity(capacity),
            }
        };

        Self {
            kind,
            groups_count,
            entries,
        }
    }

    /// Returns the bitmap of `group`, stored at `block_number`, loading it if necessary.
    ///
    /// # Panics
    ///
    /// Panics if `group` is not a group of the filesystem.
    pub fn load(
        &mut self,
        group: GroupNumber,
        block_number: BlockNumber,
        source: &dyn BitmapSource,
    ) -> Result<&mut Bitmap> {
        assert!(
            group < self.groups_count,
            "{} bitmap: group {group} out of range ({} groups)",
            self.kind,
            self.groups_count
        );

        match &mut self.entries {
            Entries::Direct(slots) => {
                let slot = &mut slots[group];
                let bitmap = match slot.take() {
                    Some(bitmap) => bitmap,
                    None => {
                        debug!("loading {} bitmap of group {group}", self.kind);
                        Bitmap::read(group, block_number, source)?
                    }
                };

                Ok(slot.insert(bitmap))
            }
            Entries::Lru { capacity, bitmaps } => {
                if let Some(position) = bitmaps.iter().position(|bitmap| bitmap.group == group) {
                    let hit = bitmaps.remove(position);
                    bitmaps.insert(0, hit);
                } else {
                    if bitmaps.len() >= *capacity {
                        if let Some(victim) = bitmaps.last_mut() {
                            victim.write_back(source)?;
                            debug!("evicting {} bitmap of group {}", self.kind, victim.group);
                        }
                        bitmaps.pop();
                    }

                    debug!("loading {} bitmap of group {group}", self.kind);
                    let bitmap = Bitmap::read(group, block_number, source)?;
                    bitmaps.insert(0, bitmap);
                }

                Ok(&mut bitmaps[0])
            }
        }
    }

    /// Writes every dirty bitmap back to its block.
    pub fn flush(&mut self, source: &dyn BitmapSource) -> Result<()> {
        match &mut self.entries {
            Entries::Direct(slots) => slots
                .iter_mut()
                .flatten()
                .try_for_each(|bitmap| bitmap.write_back(source)),
            Entries::Lru { bitmaps, .. } => bitmaps
                .iter_mut()
                .try_for_each(|bitmap| bitmap.write_back(source)),
        }
    }

    /// Whether every group has its own slot.
    pub fn is_direct(&self) -> bool {
        matches!(self.entries, Entries::Direct(_))
    }

    /// The groups whose bitmaps are loaded, most recently used first when the cache is ordered.
    pub fn resident_groups(&self) -> Vec<GroupNumber> {
        match &self.entries {
            Entries::Direct(slots) => slots.iter().flatten().map(Bitmap::group).collect(),
            Entries::Lru { bitmaps, .. } => bitmaps.iter().map(Bitmap::group).collect(),
        }
    }
}
