//! Small, consistent ext2 images for the tests.
//!
//! Images use 1 KiB blocks and revision 0 (128-byte inodes, no sparse superblocks, inodes 1 to
//! 10 reserved). Every group starts with a superblock backup, the descriptor table, its two
//! bitmaps and its inode table. Directories are limited to a single block.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::config::Config;
use crate::disk_format::block::{read_pointer, write_pointer, BlockNumber, SUPER_BLOCK_OFFSET};
use crate::disk_format::directory_entry::{
    record_len, write_entry, DirectoryEntries, DirectoryFileType,
};
use crate::disk_format::group_descriptor::{GroupDescriptor, GroupNumber, GROUP_DESCRIPTOR_SIZE};
use crate::disk_format::inode::{Inode, InodeNumber, ROOT_INODE, S_IFDIR, S_IFREG};
use crate::disk_format::super_block::{
    DiskSuperBlock, ErrorPolicy, FsState, EXT2_MAGIC, GOOD_OLD_REV,
};
use crate::inode_table::InodeTable;
use crate::mount::DeviceId;
use crate::resolver::BlockPath;
use crate::storage::{BlockDevice, MemoryDevice};
use crate::super_block::SuperBlock;

pub const BLOCK_SIZE: usize = 1024;
const INODES_PER_BLOCK: usize = BLOCK_SIZE / 128;
const FIRST_INODE: InodeNumber = 11;

/// The device the test images are mounted as.
pub const TEST_DEV: DeviceId = DeviceId(0x0301);

pub struct ImageBuilder {
    groups: usize,
    blocks_per_group: usize,
    inodes_per_group: usize,
    last_group_blocks: Option<usize>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            groups: 1,
            blocks_per_group: 1024,
            inodes_per_group: 64,
            last_group_blocks: None,
        }
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn blocks_per_group(mut self, blocks_per_group: usize) -> Self {
        self.blocks_per_group = blocks_per_group;
        self
    }

    pub fn inodes_per_group(mut self, inodes_per_group: usize) -> Self {
        self.inodes_per_group = inodes_per_group;
        self
    }

    /// Shortens the last group.
    pub fn last_group_blocks(mut self, blocks: usize) -> Self {
        self.last_group_blocks = Some(blocks);
        self
    }

    pub fn build(self) -> TestImage {
        let bpg = self.blocks_per_group;
        let ipg = self.inodes_per_group;
        let last = self.last_group_blocks.unwrap_or(bpg);
        let blocks_count = 1 + (self.groups - 1) * bpg + last;
        let desc_blocks = (self.groups * GROUP_DESCRIPTOR_SIZE).div_ceil(BLOCK_SIZE);
        let overhead = 1 + desc_blocks + 2 + ipg / INODES_PER_BLOCK;
        assert!(last > overhead, "last group too small for its metadata");

        let super_block = DiskSuperBlock {
            inodes_count: (self.groups * ipg) as u32,
            blocks_count: blocks_count as u32,
            r_blocks_count: 0,
            free_blocks_count: 0,
            free_inodes_count: 0,
            first_data_block: 1,
            log_block_size: 0,
            log_frag_size: 0,
            blocks_per_group: bpg as u32,
            frags_per_group: bpg as u32,
            inodes_per_group: ipg as u32,
            mtime: 0,
            wtime: 0,
            mnt_count: 0,
            max_mnt_count: -1,
            magic: EXT2_MAGIC,
            state: FsState::Valid,
            errors: ErrorPolicy::Continue,
            minor_rev_level: 0,
            lastcheck: 0,
            checkinterval: 0,
            creator_os: 0,
            rev_level: GOOD_OLD_REV,
            def_resuid: 0,
            def_resgid: 0,
            first_ino: 0,
            inode_size: 0,
            block_group_nr: 0,
            feature_compat: 0,
            feature_incompat: 0,
            feature_ro_compat: 0,
        };

        let mut image = TestImage {
            bytes: vec![0; blocks_count * BLOCK_SIZE],
            groups: self.groups,
            blocks_per_group: bpg,
            inodes_per_group: ipg,
            desc_blocks,
        };
        image.set_super_block(&super_block);

        for group in 0..self.groups {
            let start = image.group_start(group);
            let group_blocks = image.group_blocks(group);
            let descriptor = GroupDescriptor {
                block_bitmap: (start + 1 + desc_blocks) as u32,
                inode_bitmap: (start + 2 + desc_blocks) as u32,
                inode_table: (start + 3 + desc_blocks) as u32,
                free_blocks_count: (group_blocks - overhead) as u16,
                free_inodes_count: ipg as u16,
                used_dirs_count: 0,
                pad: 0,
                reserved: [0; 12],
            };
            image.set_descriptor(group, &descriptor);

            let block_bitmap = image.block_mut(descriptor.block_bitmap());
            for bit in (0..overhead).chain(group_blocks..bpg) {
                block_bitmap[bit / 8] |= 1 << (bit % 8);
            }
            block_bitmap[bpg / 8..].fill(0xff);
            image.block_mut(descriptor.inode_bitmap())[ipg / 8..].fill(0xff);
        }

        image.update_super_block(|sb| {
            sb.free_blocks_count = (blocks_count - 1 - overhead * self.groups) as u32;
            sb.free_inodes_count = (self.groups * ipg) as u32;
        });

        for _ in 1..FIRST_INODE {
            image.alloc_inode(false);
        }

        let root_block = image.alloc_block();
        let root = Inode {
            mode: S_IFDIR | 0o755,
            size: BLOCK_SIZE as u32,
            links_count: 2,
            blocks: 2,
            block: [root_block as u32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            ..Inode::default()
        };
        image.write_inode(ROOT_INODE, &root);
        image.update_descriptor(0, |descriptor| descriptor.used_dirs_count += 1);
        image.init_directory_block(root_block, ROOT_INODE, ROOT_INODE);

        image.write_backups();
        image
    }
}

/// An ext2 image held in memory.
#[derive(Clone)]
pub struct TestImage {
    bytes: Vec<u8>,
    groups: usize,
    blocks_per_group: usize,
    inodes_per_group: usize,
    desc_blocks: usize,
}

impl TestImage {
    /// Reopens the bytes of a device formatted by [`ImageBuilder`].
    pub fn open(bytes: Vec<u8>) -> Self {
        let sb = DiskSuperBlock::decode(&bytes[SUPER_BLOCK_OFFSET..]).unwrap();
        let bpg = sb.blocks_per_group as usize;
        let groups = (sb.blocks_count as usize - 1).div_ceil(bpg);

        Self {
            bytes,
            groups,
            blocks_per_group: bpg,
            inodes_per_group: sb.inodes_per_group as usize,
            desc_blocks: (groups * GROUP_DESCRIPTOR_SIZE).div_ceil(BLOCK_SIZE),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    pub fn device(&self) -> Arc<MemoryDevice> {
        Arc::new(MemoryDevice::from_bytes(self.bytes.clone()))
    }

    pub fn load_super_block(&self, config: &Config) -> Result<SuperBlock> {
        SuperBlock::load(TEST_DEV, self.device(), config)
    }

    /// Mounts a copy of the image as [`TEST_DEV`] in a fresh inode table.
    pub fn mount(&self, config: Config) -> (InodeTable, Arc<MemoryDevice>) {
        let device = self.device();
        let table = InodeTable::new(config);
        table.mount(TEST_DEV, device.clone(), None).unwrap();

        (table, device)
    }

    pub fn block(&self, block_number: BlockNumber) -> &[u8] {
        &self.bytes[block_number * BLOCK_SIZE..(block_number + 1) * BLOCK_SIZE]
    }

    pub fn block_mut(&mut self, block_number: BlockNumber) -> &mut [u8] {
        &mut self.bytes[block_number * BLOCK_SIZE..(block_number + 1) * BLOCK_SIZE]
    }

    pub fn super_block(&self) -> DiskSuperBlock {
        DiskSuperBlock::decode(&self.bytes[SUPER_BLOCK_OFFSET..]).unwrap()
    }

    pub fn set_super_block(&mut self, sb: &DiskSuperBlock) {
        sb.encode_into(&mut self.bytes[SUPER_BLOCK_OFFSET..]);
    }

    pub fn update_super_block(&mut self, f: impl FnOnce(&mut DiskSuperBlock)) {
        let mut sb = self.super_block();
        f(&mut sb);
        self.set_super_block(&sb);
    }

    pub fn descriptor(&self, group: GroupNumber) -> GroupDescriptor {
        let block = self.block(2 + group * GROUP_DESCRIPTOR_SIZE / BLOCK_SIZE);
        GroupDescriptor::decode_block(block)[group % (BLOCK_SIZE / GROUP_DESCRIPTOR_SIZE)]
    }

    pub fn set_descriptor(&mut self, group: GroupNumber, descriptor: &GroupDescriptor) {
        let per_block = BLOCK_SIZE / GROUP_DESCRIPTOR_SIZE;
        descriptor.encode_into_block(self.block_mut(2 + group / per_block), group % per_block);
    }

    pub fn update_descriptor(&mut self, group: GroupNumber, f: impl FnOnce(&mut GroupDescriptor)) {
        let mut descriptor = self.descriptor(group);
        f(&mut descriptor);
        self.set_descriptor(group, &descriptor);
    }

    pub fn group_start(&self, group: GroupNumber) -> BlockNumber {
        1 + group * self.blocks_per_group
    }

    /// The number of blocks in `group`, shorter for a truncated last group.
    pub fn group_blocks(&self, group: GroupNumber) -> usize {
        let blocks_count = self.bytes.len() / BLOCK_SIZE;
        (blocks_count - self.group_start(group)).min(self.blocks_per_group)
    }

    pub fn is_block_used(&self, block_number: BlockNumber) -> bool {
        let group = (block_number - 1) / self.blocks_per_group;
        let bit = (block_number - 1) % self.blocks_per_group;
        let bitmap = self.block(self.descriptor(group).block_bitmap());

        bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    pub fn is_inode_used(&self, ino: InodeNumber) -> bool {
        let group = (ino as usize - 1) / self.inodes_per_group;
        let bit = (ino as usize - 1) % self.inodes_per_group;
        let bitmap = self.block(self.descriptor(group).inode_bitmap());

        bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Allocates the first free block, zeroed.
    pub fn alloc_block(&mut self) -> BlockNumber {
        for group in 0..self.groups {
            let bitmap_block = self.descriptor(group).block_bitmap();
            let group_blocks = self.group_blocks(group);
            let bitmap = self.block_mut(bitmap_block);

            let Some(bit) = (0..group_blocks).find(|bit| bitmap[bit / 8] & (1 << (bit % 8)) == 0)
            else {
                continue;
            };
            bitmap[bit / 8] |= 1 << (bit % 8);

            self.update_descriptor(group, |descriptor| descriptor.free_blocks_count -= 1);
            self.update_super_block(|sb| sb.free_blocks_count -= 1);

            let block_number = self.group_start(group) + bit;
            self.block_mut(block_number).fill(0);
            return block_number;
        }

        panic!("test image is full");
    }

    pub fn alloc_inode(&mut self, directory: bool) -> InodeNumber {
        for group in 0..self.groups {
            let bitmap_block = self.descriptor(group).inode_bitmap();
            let ipg = self.inodes_per_group;
            let bitmap = self.block_mut(bitmap_block);

            let Some(bit) = (0..ipg).find(|bit| bitmap[bit / 8] & (1 << (bit % 8)) == 0) else {
                continue;
            };
            bitmap[bit / 8] |= 1 << (bit % 8);

            self.update_descriptor(group, |descriptor| {
                descriptor.free_inodes_count -= 1;
                if directory {
                    descriptor.used_dirs_count += 1;
                }
            });
            self.update_super_block(|sb| sb.free_inodes_count -= 1);

            return (group * ipg + bit + 1) as InodeNumber;
        }

        panic!("test image has no free inodes");
    }

    fn inode_location(&self, ino: InodeNumber) -> (BlockNumber, usize) {
        let group = (ino as usize - 1) / self.inodes_per_group;
        let local = (ino as usize - 1) % self.inodes_per_group;

        (
            self.descriptor(group).inode_table() + local / INODES_PER_BLOCK,
            local % INODES_PER_BLOCK,
        )
    }

    pub fn read_inode(&self, ino: InodeNumber) -> Inode {
        let (block_number, index) = self.inode_location(ino);
        Inode::decode_from_block(self.block(block_number), index, 128)
    }

    pub fn write_inode(&mut self, ino: InodeNumber, inode: &Inode) {
        let (block_number, index) = self.inode_location(ino);
        inode.encode_into_block(self.block_mut(block_number), index, 128);
    }

    fn init_directory_block(&mut self, block_number: BlockNumber, ino: InodeNumber, parent: InodeNumber) {
        let block = self.block_mut(block_number);
        write_entry(block, 0, ino, 12, DirectoryFileType::Directory, b".").unwrap();
        write_entry(block, 12, parent, BLOCK_SIZE - 12, DirectoryFileType::Directory, b"..")
            .unwrap();
    }

    /// Appends an entry to a single-block directory.
    pub fn add_entry(
        &mut self,
        dir: InodeNumber,
        name: &str,
        ino: InodeNumber,
        file_type: DirectoryFileType,
    ) {
        let block_number = self.read_inode(dir).block[0] as BlockNumber;
        let block = self.block_mut(block_number);

        let (last_offset, last_name_len) = DirectoryEntries::new(block)
            .scan(0, |offset, entry| {
                let entry = entry.unwrap();
                let this = *offset;
                *offset += entry.header.rec_len as usize;
                Some((this, entry.name.len()))
            })
            .last()
            .unwrap();

        let shrunk = record_len(last_name_len);
        let offset = last_offset + shrunk;
        assert!(offset + record_len(name.len()) <= BLOCK_SIZE, "directory block is full");

        block[last_offset + 4..last_offset + 6].copy_from_slice(&(shrunk as u16).to_le_bytes());
        write_entry(block, offset, ino, BLOCK_SIZE - offset, file_type, name.as_bytes()).unwrap();
    }

    pub fn add_directory(&mut self, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = self.alloc_inode(true);
        let block_number = self.alloc_block();
        let inode = Inode {
            mode: S_IFDIR | 0o755,
            size: BLOCK_SIZE as u32,
            links_count: 2,
            blocks: 2,
            block: [block_number as u32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            ..Inode::default()
        };
        self.write_inode(ino, &inode);
        self.init_directory_block(block_number, ino, parent);

        let mut parent_inode = self.read_inode(parent);
        parent_inode.links_count += 1;
        self.write_inode(parent, &parent_inode);
        self.add_entry(parent, name, ino, DirectoryFileType::Directory);

        ino
    }

    /// Adds a regular file of `size` bytes. Block `i` of the file is filled with `i as u8`.
    pub fn add_file(&mut self, parent: InodeNumber, name: &str, size: usize) -> InodeNumber {
        let ino = self.alloc_inode(false);
        let mut inode = Inode {
            mode: S_IFREG | 0o644,
            size: size as u32,
            links_count: 1,
            ..Inode::default()
        };

        for logical in 0..size.div_ceil(BLOCK_SIZE) {
            let block_number = self.alloc_block();
            self.block_mut(block_number).fill(logical as u8);
            self.map_block(&mut inode, logical, block_number);
        }

        self.write_inode(ino, &inode);
        self.add_entry(parent, name, ino, DirectoryFileType::Regular);

        ino
    }

    /// Points logical block `logical` of `inode` at `block_number`, allocating indirect blocks
    /// on the way.
    pub fn map_block(&mut self, inode: &mut Inode, logical: usize, block_number: BlockNumber) {
        let path = BlockPath::new(logical, BLOCK_SIZE / 4).unwrap();
        inode.blocks += 2;

        let slot = path.slot();
        let Some((last, outer)) = path.offsets().split_last() else {
            inode.block[slot] = block_number as u32;
            return;
        };

        if inode.block[slot] == 0 {
            inode.block[slot] = self.alloc_block() as u32;
            inode.blocks += 2;
        }

        let mut table = inode.block[slot] as BlockNumber;
        for offset in outer {
            let mut next = read_pointer(self.block(table), *offset);
            if next == 0 {
                next = self.alloc_block();
                inode.blocks += 2;
                write_pointer(self.block_mut(table), *offset, next);
            }
            table = next;
        }

        write_pointer(self.block_mut(table), *last, block_number);
    }

    /// Copies the primary superblock and descriptor table to every other group.
    pub fn write_backups(&mut self) {
        let primary_super = self.block(1).to_vec();
        let primary_descriptors = self.bytes[2 * BLOCK_SIZE..(2 + self.desc_blocks) * BLOCK_SIZE].to_vec();

        for group in 1..self.groups {
            let start = self.group_start(group);
            self.block_mut(start).copy_from_slice(&primary_super);
            self.bytes[(start + 1) * BLOCK_SIZE..(start + 1 + self.desc_blocks) * BLOCK_SIZE]
                .copy_from_slice(&primary_descriptors);
        }
    }
}

/// A device whose reads of selected 1 KiB blocks fail.
pub struct FailingDevice {
    inner: MemoryDevice,
    failing: Mutex<HashSet<BlockNumber>>,
}

impl FailingDevice {
    pub fn new(image: &TestImage) -> Self {
        Self {
            inner: MemoryDevice::from_bytes(image.bytes().to_vec()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail(&self, block_number: BlockNumber) {
        self.failing.lock().unwrap().insert(block_number);
    }

    pub fn heal(&self, block_number: BlockNumber) {
        self.failing.lock().unwrap().remove(&block_number);
    }
}

impl BlockDevice for FailingDevice {
    fn read_block(&self, block_number: BlockNumber, buf: &mut [u8]) -> Result<()> {
        if self.failing.lock().unwrap().contains(&block_number) {
            bail!("I/O error reading block {block_number}");
        }

        self.inner.read_block(block_number, buf)
    }

    fn write_block(&self, block_number: BlockNumber, buf: &[u8]) -> Result<()> {
        self.inner.write_block(block_number, buf)
    }
}
