/// The block device abstraction.
mod block_device;
/// The write-back buffer cache.
mod buffer;
/// File-backed block devices.
mod file;
/// In-memory block devices.
mod memory;

pub use block_device::*;
pub use buffer::*;
pub use file::*;
pub use memory::*;
