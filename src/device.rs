use crate::fs::{BlockDevice, SectorId, BLOCK_SIZE};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

pub struct BlockFile(pub Mutex<File>);

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的扇区的时候，我们必须先 seek 到这个扇区的开头位置

impl BlockDevice for BlockFile {
    /// 从文件读取一个扇区
    fn read_block(&self, sector: SectorId, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(sector.byte_offset(BLOCK_SIZE)))
            .expect("Error when seeking!");
        file.read_exact(buf).expect("Not a complete block");
    }

    /// 写一个扇区到文件
    fn write_block(&self, sector: SectorId, buf: &[u8]) {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(sector.byte_offset(BLOCK_SIZE)))
            .expect("Error when seeking!");
        file.write_all(buf).expect("Not a complete block");
    }
}

/// 内存中的虚拟磁盘, 记录读写次数, 测试时用来观察块缓存的行为
pub struct MemoryDisk {
    sectors: Mutex<Vec<[u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryDisk {
    pub fn new(count: usize) -> Self {
        Self::filled(count, 0)
    }

    /// 每个字节都是 byte 的磁盘
    pub fn filled(count: usize, byte: u8) -> Self {
        Self {
            sectors: Mutex::new(vec![[byte; BLOCK_SIZE]; count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 直接查看设备上的内容 (绕过块缓存, 不计入读次数)
    pub fn sector_bytes(&self, sector: SectorId) -> [u8; BLOCK_SIZE] {
        self.sectors.lock().unwrap_or_else(PoisonError::into_inner)[sector.raw() as usize]
    }

    /// 直接改写设备上的内容 (绕过块缓存, 不计入写次数)
    pub fn overwrite(&self, sector: SectorId, bytes: &[u8; BLOCK_SIZE]) {
        self.sectors.lock().unwrap_or_else(PoisonError::into_inner)[sector.raw() as usize] = *bytes;
    }
}

impl BlockDevice for MemoryDisk {
    fn read_block(&self, sector: SectorId, buf: &mut [u8]) {
        let sectors = self.sectors.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&sectors[sector.raw() as usize]);
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write_block(&self, sector: SectorId, buf: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap_or_else(PoisonError::into_inner);
        sectors[sector.raw() as usize].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}
