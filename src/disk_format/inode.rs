use std::mem::size_of;

use serde::{Deserialize, Serialize};

/// inode numbers are one-indexed; zero means "no inode" in directory entries.
pub type InodeNumber = u32;

/// The size of an inode record in revision 0 filesystems.
pub const INODE_SIZE: usize = 128;

pub const NUM_DIRECT: usize = 12;
/// Index of the single-indirect pointer in [`Inode::block`].
pub const IND_BLOCK: usize = NUM_DIRECT;
/// Index of the double-indirect pointer in [`Inode::block`].
pub const DIND_BLOCK: usize = IND_BLOCK + 1;
/// Index of the triple-indirect pointer in [`Inode::block`].
pub const TIND_BLOCK: usize = DIND_BLOCK + 1;
pub const NUM_BLOCK_POINTERS: usize = TIND_BLOCK + 1;

pub const BAD_BLOCKS_INODE: InodeNumber = 1;
pub const ROOT_INODE: InodeNumber = 2;

/// `i_blocks` counts 512-byte sectors, not filesystem blocks.
pub const SECTOR_SIZE: usize = 512;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

/// An on-disk inode record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct Inode {
    /// File format and access rights.
    pub mode: u16,
    /// Low 16 bits of the owner id.
    pub uid: u16,
    /// File size in bytes (low 32 bits).
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Deletion time.
    pub dtime: u32,
    /// Low 16 bits of the group id.
    pub gid: u16,
    /// Number of hard links.
    pub links_count: u16,
    /// Number of 512-byte sectors reserved for the inode's data, indirect blocks included.
    pub blocks: u32,
    pub flags: u32,
    pub reserved1: u32,
    /// 12 direct pointers followed by the single-, double- and triple-indirect pointers.
    pub block: [u32; NUM_BLOCK_POINTERS],
    /// File version, used by network filesystems.
    pub generation: u32,
    /// Block holding extended attributes.
    pub file_acl: u32,
    /// High 32 bits of the size for regular files in revision 1.
    pub dir_acl: u32,
    /// Fragment address.
    pub faddr: u32,
    pub reserved2: [u8; 12],
}

const_assert!(size_of::<Inode>() == INODE_SIZE);

/// The type of file an inode describes, derived from its mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Socket,
    Symlink,
    Regular,
    BlockDevice,
    Directory,
    CharDevice,
    Fifo,
    /// A mode without a known format. Free inodes have mode 0.
    Unknown,
}

impl Inode {
    /// Decodes an inode record from the start of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`INODE_SIZE`].
    pub fn decode(bytes: &[u8]) -> Inode {
        bincode::deserialize(&bytes[..INODE_SIZE])
            .expect("INODE_SIZE bytes always hold a complete inode")
    }

    /// Encodes this inode into a record of exactly [`INODE_SIZE`] bytes.
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        bincode::serialize(self)
            .expect("serializing fixed-size integers cannot fail")
            .try_into()
            .expect("Inode serializes to INODE_SIZE bytes")
    }

    /// Decodes the `index`th record of an inode table block holding `inode_size`-byte records.
    pub fn decode_from_block(block: &[u8], index: usize, inode_size: usize) -> Inode {
        let offset = index * inode_size;
        Inode::decode(&block[offset..offset + inode_size])
    }

    /// Writes this inode into the `index`th record of an inode table block, leaving the other
    /// records (and any bytes past [`INODE_SIZE`] in larger records) untouched.
    pub fn encode_into_block(&self, block: &mut [u8], index: usize, inode_size: usize) {
        assert!(inode_size >= INODE_SIZE);

        let offset = index * inode_size;
        block[offset..offset + INODE_SIZE].copy_from_slice(&self.encode());
    }

    pub fn kind(&self) -> FileKind {
        match self.mode & S_IFMT {
            S_IFSOCK => FileKind::Socket,
            S_IFLNK => FileKind::Symlink,
            S_IFREG => FileKind::Regular,
            S_IFBLK => FileKind::BlockDevice,
            S_IFDIR => FileKind::Directory,
            S_IFCHR => FileKind::CharDevice,
            S_IFIFO => FileKind::Fifo,
            _ => FileKind::Unknown,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// The number of filesystem blocks needed to hold `size` bytes.
    pub fn size_in_blocks(&self, block_size: usize) -> usize {
        (self.size as usize).div_ceil(block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inode() -> Inode {
        let mut block = [0; NUM_BLOCK_POINTERS];
        for (i, pointer) in block.iter_mut().enumerate() {
            *pointer = 100 + i as u32;
        }

        Inode {
            mode: S_IFREG | 0o644,
            uid: 1000,
            size: 70_000,
            atime: 1_700_000_000,
            ctime: 1_700_000_001,
            mtime: 1_700_000_002,
            dtime: 0,
            gid: 100,
            links_count: 1,
            blocks: 140,
            flags: 0,
            reserved1: 0,
            block,
            generation: 7,
            file_acl: 0,
            dir_acl: 0,
            faddr: 0,
            reserved2: [0; 12],
        }
    }

    #[test]
    fn test_field_offsets() {
        let bytes = sample_inode().encode();

        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), S_IFREG | 0o644);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 1000);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 70_000);
        assert_eq!(u16::from_le_bytes([bytes[24], bytes[25]]), 100);
        assert_eq!(u16::from_le_bytes([bytes[26], bytes[27]]), 1);
        assert_eq!(u32::from_le_bytes(bytes[28..32].try_into().unwrap()), 140);
        // i_block starts at offset 40
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 100);
        assert_eq!(u32::from_le_bytes(bytes[96..100].try_into().unwrap()), 114);
        assert_eq!(u32::from_le_bytes(bytes[100..104].try_into().unwrap()), 7);
    }

    #[test]
    fn test_round_trip_through_raw_bytes() {
        let mut raw = [0u8; INODE_SIZE];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = (i * 7 + 3) as u8;
        }

        assert_eq!(Inode::decode(&raw).encode(), raw);
    }

    #[test]
    fn test_encode_into_block_only_touches_its_slot() {
        let mut block = [0xaa; 1024];
        let inode = sample_inode();

        inode.encode_into_block(&mut block, 3, INODE_SIZE);

        assert!(block[..3 * INODE_SIZE].iter().all(|b| *b == 0xaa));
        assert!(block[4 * INODE_SIZE..].iter().all(|b| *b == 0xaa));
        assert_eq!(Inode::decode_from_block(&block, 3, INODE_SIZE), inode);
    }

    #[test]
    fn test_larger_inode_records() {
        let mut block = [0x55; 1024];
        let inode = sample_inode();

        inode.encode_into_block(&mut block, 2, 256);

        assert_eq!(Inode::decode_from_block(&block, 2, 256), inode);
        // the extended part of the record is preserved
        assert!(block[2 * 256 + INODE_SIZE..3 * 256].iter().all(|b| *b == 0x55));
    }

    #[test]
    #[should_panic]
    fn test_decode_short_slice() {
        let _ = Inode::decode(&[0; 64]);
    }

    #[test]
    fn test_kind() {
        let mut inode = Inode::default();
        assert_eq!(inode.kind(), FileKind::Unknown);

        inode.mode = S_IFDIR | 0o755;
        assert!(inode.is_directory());

        inode.mode = S_IFBLK;
        assert_eq!(inode.kind(), FileKind::BlockDevice);

        inode.mode = S_IFLNK | 0o777;
        assert_eq!(inode.kind(), FileKind::Symlink);
    }

    #[test]
    fn test_size_in_blocks() {
        let inode = sample_inode();
        assert_eq!(inode.size_in_blocks(1024), 69);
        assert_eq!(Inode::default().size_in_blocks(1024), 0);
    }
}
