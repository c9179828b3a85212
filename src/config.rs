use clap::Args;

/// `NR_INODE`: the number of in-core inode slots.
pub const DEFAULT_INODE_TABLE_CAPACITY: usize = 32;

/// The number of block (and inode) bitmaps kept loaded per mounted filesystem.
pub const DEFAULT_BITMAP_CACHE_CAPACITY: usize = 8;

/// Sizes of the bounded in-memory tables.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of slots in the in-core inode table
    #[arg(long, default_value_t = DEFAULT_INODE_TABLE_CAPACITY)]
    pub inode_table_capacity: usize,

    /// Number of block and inode bitmaps cached per mounted filesystem
    #[arg(long, default_value_t = DEFAULT_BITMAP_CACHE_CAPACITY)]
    pub bitmap_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inode_table_capacity: DEFAULT_INODE_TABLE_CAPACITY,
            bitmap_cache_capacity: DEFAULT_BITMAP_CACHE_CAPACITY,
        }
    }
}
