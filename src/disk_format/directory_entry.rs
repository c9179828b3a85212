use std::fmt;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::inode::InodeNumber;

/// The number of bytes in front of the name of every directory entry.
pub const DIRECTORY_ENTRY_HEADER_SIZE: usize = 8;

/// The maximum length of a name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Directory entries are aligned to this many bytes.
pub const DIRECTORY_ENTRY_ALIGN: usize = 4;

/// The fixed part of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct DirectoryEntryHeader {
    /// The inode number, or zero for an unused entry.
    pub inode: InodeNumber,
    /// Distance in bytes to the next entry.
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: DirectoryFileType,
}

/// The type hint stored in directory entries (revision 1, `filetype` feature). Revision 0
/// filesystems leave it at [`DirectoryFileType::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DirectoryFileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

/// A directory entry borrowed from a directory block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry<'a> {
    pub header: DirectoryEntryHeader,
    pub name: &'a [u8],
}

impl fmt::Debug for DirectoryEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryEntry")
            .field("inode", &self.header.inode)
            .field("rec_len", &self.header.rec_len)
            .field("name", &String::from_utf8_lossy(self.name))
            .finish()
    }
}

impl DirectoryEntry<'_> {
    pub fn is_used(&self) -> bool {
        self.header.inode != 0
    }
}

/// The smallest record length able to hold a name of `name_len` bytes.
pub fn record_len(name_len: usize) -> usize {
    (DIRECTORY_ENTRY_HEADER_SIZE + name_len).next_multiple_of(DIRECTORY_ENTRY_ALIGN)
}

/// Iterates over the entries of one directory block.
///
/// Yields an error and stops at the first malformed entry.
pub struct DirectoryEntries<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DirectoryEntries<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            failed: false,
        }
    }

    fn parse_entry(&self) -> Result<DirectoryEntry<'a>> {
        let offset = self.offset;
        let remaining = self.block.len() - offset;

        ensure!(
            remaining >= DIRECTORY_ENTRY_HEADER_SIZE,
            "directory entry header at offset {offset} crosses the block boundary"
        );

        let header: DirectoryEntryHeader =
            bincode::deserialize(&self.block[offset..offset + DIRECTORY_ENTRY_HEADER_SIZE])
                .with_context(|| format!("parsing directory entry at offset {offset}"))?;

        let rec_len = header.rec_len as usize;
        let name_len = header.name_len as usize;

        ensure!(
            rec_len % DIRECTORY_ENTRY_ALIGN == 0,
            "directory entry at offset {offset} has unaligned length {rec_len}"
        );
        ensure!(
            rec_len >= record_len(name_len),
            "directory entry at offset {offset} is too short for its name ({rec_len} bytes)"
        );
        ensure!(
            rec_len <= remaining,
            "directory entry at offset {offset} crosses the block boundary"
        );

        let name_start = offset + DIRECTORY_ENTRY_HEADER_SIZE;

        Ok(DirectoryEntry {
            header,
            name: &self.block[name_start..name_start + name_len],
        })
    }
}

impl<'a> Iterator for DirectoryEntries<'a> {
    type Item = Result<DirectoryEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }

        match self.parse_entry() {
            Ok(entry) => {
                self.offset += entry.header.rec_len as usize;
                Some(Ok(entry))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Writes a directory entry at `offset` in a directory block. Used to build images.
pub fn write_entry(
    block: &mut [u8],
    offset: usize,
    inode: InodeNumber,
    rec_len: usize,
    file_type: DirectoryFileType,
    name: &[u8],
) -> Result<()> {
    ensure!(name.len() <= MAX_NAME_LEN, "name is longer than {MAX_NAME_LEN} bytes");
    ensure!(rec_len >= record_len(name.len()), "record is too short for its name");
    ensure!(offset + rec_len <= block.len(), "record crosses the block boundary");

    let header = DirectoryEntryHeader {
        inode,
        rec_len: rec_len as u16,
        name_len: name.len() as u8,
        file_type,
    };
    let encoded = bincode::serialize(&header)?;

    block[offset..offset + DIRECTORY_ENTRY_HEADER_SIZE].copy_from_slice(&encoded);
    let name_start = offset + DIRECTORY_ENTRY_HEADER_SIZE;
    block[name_start..name_start + name.len()].copy_from_slice(name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Vec<u8> {
        let mut block = vec![0; 1024];
        write_entry(&mut block, 0, 2, 12, DirectoryFileType::Directory, b".").unwrap();
        write_entry(&mut block, 12, 2, 12, DirectoryFileType::Directory, b"..").unwrap();
        write_entry(&mut block, 24, 0, 20, DirectoryFileType::Unknown, b"").unwrap();
        write_entry(&mut block, 44, 12, 980, DirectoryFileType::Regular, b"hello.txt").unwrap();
        block
    }

    #[test]
    fn test_record_len() {
        assert_eq!(record_len(1), 12);
        assert_eq!(record_len(4), 12);
        assert_eq!(record_len(5), 16);
        assert_eq!(record_len(MAX_NAME_LEN), 264);
    }

    #[test]
    fn test_iterate_block() {
        let block = sample_block();
        let entries = DirectoryEntries::new(&block)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].name, b".");
        assert_eq!(entries[1].name, b"..");
        assert!(!entries[2].is_used());
        assert_eq!(entries[3].name, b"hello.txt");
        assert_eq!(entries[3].header.inode, 12);
        assert_eq!(entries[3].header.file_type, DirectoryFileType::Regular);
    }

    #[test]
    fn test_entry_crossing_block_boundary() {
        let mut block = sample_block();
        // stretch the last entry past the end of the block
        block[48..50].copy_from_slice(&984u16.to_le_bytes());

        let results = DirectoryEntries::new(&block).collect::<Vec<_>>();
        assert_eq!(results.len(), 4);
        assert!(results[3].is_err());
    }

    #[test]
    fn test_zero_length_entry_stops_iteration() {
        let block = vec![0u8; 1024];
        let results = DirectoryEntries::new(&block).collect::<Vec<_>>();

        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_unaligned_entry() {
        let mut block = sample_block();
        block[4..6].copy_from_slice(&13u16.to_le_bytes());

        let first = DirectoryEntries::new(&block).next().unwrap();
        assert!(first.is_err());
    }

    #[test]
    fn test_write_entry_rejects_short_record() {
        let mut block = vec![0; 1024];
        assert!(write_entry(&mut block, 0, 5, 8, DirectoryFileType::Regular, b"abc").is_err());
        assert!(write_entry(&mut block, 1020, 5, 12, DirectoryFileType::Regular, b"abc").is_err());
    }
}
