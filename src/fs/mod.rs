mod bitmap;
mod block_cache;
mod block_dev;
mod error;
mod extent_fs;
mod gate;
mod inode;
mod layout;

extern crate log;

/// Use a block size of 512 bytes
pub const BLOCK_SIZE: usize = 512;
/// 内存中同时驻留的块缓存槽位数量 (默认值), 槽位数在缓存创建之后不再改变
pub const BLOCK_CACHE_SIZE: usize = 64;
/// Magic number for sanity check
pub const INODE_MAGIC: u32 = 0x494e4f44;
/// The max number of direct pointers
pub const INODE_DIRECT_COUNT: usize = 123;
/// 一个索引块中的扇区指针数量: 512B / 4B(u32) = 128
pub const INODE_INDIRECT_COUNT: usize = BLOCK_SIZE / 4;
/// The max number of doubly indirect data blocks
pub const INODE_DOUBLY_COUNT: usize = INODE_INDIRECT_COUNT * INODE_INDIRECT_COUNT;
/// The upper bound of direct block index
pub const DIRECT_BOUND: usize = INODE_DIRECT_COUNT;
/// The upper bound of indirect block index
pub const INDIRECT_BOUND: usize = DIRECT_BOUND + INODE_INDIRECT_COUNT;
/// The upper bound of doubly indirect block index
pub const DOUBLY_BOUND: usize = INDIRECT_BOUND + INODE_DOUBLY_COUNT;
/// 一个文件最多能够索引的数据块数: 123 + 128 + 128 * 128 = 16635
pub const MAX_FILE_BLOCKS: usize = DOUBLY_BOUND;
/// 文件的最大字节数
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

pub use bitmap::{Allocator, FreeMap};
pub use block_cache::{BlockCache, PinnedSlot};
pub use block_dev::{BlockDevice, SectorId};
pub use error::{FsError, Result};
pub use extent_fs::ExtentFileSystem;
pub use gate::WriteGate;
pub use inode::{Inode, InodeTable};
pub use layout::*;
