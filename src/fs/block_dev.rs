//! 块设备仅支持以块为单位进行随机读写, 需要由具体的块设备驱动来实现这两个方法.
//! 块缓存层会调用这两个方法, 进行块缓存的管理; 索引节点层从不直接访问块设备.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.

use std::{any::Any, fmt};

// 块与扇区
// 在这里块和扇区大小相同 (512 字节), 一个扇区就是一个块.
// 扇区编号使用独立的类型 SectorId, 避免与字节偏移或者文件内的块序号混用.

/// 块设备上的扇区编号
///
/// 磁盘上的索引结构直接保存 SectorId, 因此它必须与 u32 的内存布局完全相同.
/// 值 0 在磁盘上表示 "未分配": 0 号扇区由分配器保留, 永远不会被分配出去.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectorId(u32);

impl SectorId {
    /// 磁盘上未分配的指针
    pub const UNSET: SectorId = SectorId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }

    /// 扇区在设备上的字节位置
    pub fn byte_offset(self, block_size: usize) -> u64 {
        self.0 as u64 * block_size as u64
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 块设备接口层
// 定义设备驱动需要实现的块读写接口 BlockDevice trait
// 两个方法都会阻塞调用者直到操作完成; 单个块的写入是原子的, 跨块不保证.

pub trait BlockDevice: Send + Sync + Any {
    // read_block 将编号为 sector 的块从磁盘读入内存中的缓冲区 buf ;
    fn read_block(&self, sector: SectorId, buf: &mut [u8]);

    // write_block 将内存中的缓冲区 buf 中的数据写入磁盘编号为 sector 的块.
    fn write_block(&self, sector: SectorId, buf: &[u8]);
}
