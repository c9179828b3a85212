/// The smallest supported block size. `s_log_block_size` is a shift applied to this value.
pub const MIN_BLOCK_SIZE: usize = 1024;

/// The largest supported block size.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// The superblock always starts this many bytes into the device, regardless of the block size.
pub const SUPER_BLOCK_OFFSET: usize = 1024;

/// The number of bytes reserved for the superblock.
pub const SUPER_BLOCK_SIZE: usize = 1024;

/// Block pointers are stored as `u32`s.
pub const POINTER_SIZE: usize = 4;

const_assert!(MIN_BLOCK_SIZE % POINTER_SIZE == 0);
const_assert!(SUPER_BLOCK_OFFSET % SUPER_BLOCK_SIZE == 0);

// block numbers are represented as `u32`s on the disk, but we use `usize`s to avoid littering
// the code with casts.
pub type BlockNumber = usize;

/// Computes the block size from the superblock's `s_log_block_size`.
pub fn block_size_from_log(log_block_size: u32) -> Option<usize> {
    let block_size = MIN_BLOCK_SIZE.checked_shl(log_block_size)?;

    (block_size <= MAX_BLOCK_SIZE).then_some(block_size)
}

/// The number of block pointers that fit in one (indirect) block.
pub fn addr_per_block(block_size: usize) -> usize {
    block_size / POINTER_SIZE
}

/// Reads the `index`th block pointer out of an indirect block.
pub fn read_pointer(block: &[u8], index: usize) -> BlockNumber {
    let start = index * POINTER_SIZE;
    let bytes: [u8; POINTER_SIZE] = block[start..start + POINTER_SIZE]
        .try_into()
        .expect("slice has exactly POINTER_SIZE bytes");

    u32::from_le_bytes(bytes) as BlockNumber
}

/// Writes the `index`th block pointer of an indirect block.
pub fn write_pointer(block: &mut [u8], index: usize, pointer: BlockNumber) {
    let start = index * POINTER_SIZE;
    block[start..start + POINTER_SIZE].copy_from_slice(&(pointer as u32).to_le_bytes());
}
