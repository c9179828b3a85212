pub mod bitmap;
pub mod checker;
pub mod config;
pub mod directory;
pub mod disk_format;
pub mod error;
pub mod inode_table;
pub mod mount;
pub mod resolver;
pub mod storage;
pub mod super_block;
pub mod truncate;

#[cfg(test)]
mod testing;
