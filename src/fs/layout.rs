//! 磁盘数据结构层: 索引节点 [`DiskInode`] 以及它用到的索引块
//!
//! 每个文件/目录在磁盘上都以一个 DiskInode 的形式存储, 它恰好占据一个扇区.
//! 文件内容按块组织成三级索引:
//!
//! - 直接索引: DiskInode 内的 123 个指针, 指向文件的前 123 个数据块
//! - 一级间接索引: 指向一个索引块, 索引块中的 128 个指针指向数据块
//! - 二级间接索引: 指向一个索引块, 其中每个指针指向一个中间索引块, 中间索引块再指向数据块
//!
//! 三级索引统一抽象为 [`IndexTier`], 解析, 扩容和回收都按层级依次进行.
//! 所有的磁盘访问都经过块缓存层.

use std::{
    fmt::{Debug, Formatter},
    mem,
    vec::IntoIter,
};

use log::error;

use super::{
    BlockCache, FsError, Result, SectorId, BLOCK_SIZE, DIRECT_BOUND, INDIRECT_BOUND,
    INODE_DIRECT_COUNT, INODE_DOUBLY_COUNT, INODE_INDIRECT_COUNT, INODE_MAGIC, MAX_FILE_BLOCKS,
    MAX_FILE_SIZE,
};

/// 可以直接在块缓冲区上解释的磁盘数据结构
///
/// # Safety
///
/// 实现者必须是没有填充字节以外约束的纯数据类型: 任意字节序列都必须是它的合法值.
pub unsafe trait OnDisk: Copy {}

/// 索引块实质上是一个扇区指针数组, 每个都指向一个下一级索引块或者数据块
pub type IndexBlock = [SectorId; INODE_INDIRECT_COUNT]; // size = 512B / 4B(u32) = 128

/// 作为一个文件而言, 它的内容在文件系统看来都只是一个字节序列,
/// 因此每个保存内容的数据块都只是一个字节数组
pub type DataBlock = [u8; BLOCK_SIZE];

/// 全零的块, 新分配的扇区在链接进索引之前都用它填充
pub static ZERO_BLOCK: DataBlock = [0; BLOCK_SIZE];

unsafe impl OnDisk for IndexBlock {}
unsafe impl OnDisk for DataBlock {}
unsafe impl OnDisk for DiskInode {}

/// 索引层级
///
/// 每一层负责文件中一段连续的块序号: [start, start + capacity).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndexTier {
    Direct,
    Indirect,
    DoublyIndirect,
}

impl IndexTier {
    pub const ALL: [IndexTier; 3] = [
        IndexTier::Direct,
        IndexTier::Indirect,
        IndexTier::DoublyIndirect,
    ];

    /// 该层负责的第一个块序号
    pub const fn start(self) -> usize {
        match self {
            IndexTier::Direct => 0,
            IndexTier::Indirect => DIRECT_BOUND,
            IndexTier::DoublyIndirect => INDIRECT_BOUND,
        }
    }

    /// 该层最多能索引的数据块数
    pub const fn capacity(self) -> usize {
        match self {
            IndexTier::Direct => INODE_DIRECT_COUNT,
            IndexTier::Indirect => INODE_INDIRECT_COUNT,
            IndexTier::DoublyIndirect => INODE_DOUBLY_COUNT,
        }
    }

    /// 文件共有 data_blocks 个数据块时, 落在该层的数据块数
    pub fn blocks_in(self, data_blocks: usize) -> usize {
        data_blocks
            .saturating_sub(self.start())
            .min(self.capacity())
    }

    /// 该层索引 blocks 个数据块需要的索引块数 (锚块以及中间索引块)
    pub fn index_blocks(self, blocks: usize) -> usize {
        match self {
            IndexTier::Direct => 0,
            IndexTier::Indirect => usize::from(blocks > 0),
            IndexTier::DoublyIndirect if blocks == 0 => 0,
            IndexTier::DoublyIndirect => {
                1 + (blocks + INODE_INDIRECT_COUNT - 1) / INODE_INDIRECT_COUNT
            }
        }
    }

    /// 将文件内的块序号定位到 (层级, 层内序号)
    pub fn locate(block: usize) -> Option<(IndexTier, usize)> {
        Self::ALL
            .into_iter()
            .find(|tier| block < tier.start() + tier.capacity())
            .map(|tier| (tier, block - tier.start()))
    }

    /// 查找层内第 local 个数据块的扇区
    fn resolve(self, inode: &DiskInode, local: usize, cache: &BlockCache) -> Result<SectorId> {
        match self {
            IndexTier::Direct => Ok(inode.direct[local]),
            IndexTier::Indirect => read_entry(cache, inode.indirect, local),
            IndexTier::DoublyIndirect => {
                // 先查二级索引块找到挂在它下面的中间索引块, 再通过中间索引块找到数据块
                let middle_pos = local / INODE_INDIRECT_COUNT;
                let middle = read_entry(cache, inode.doubly_indirect, middle_pos)?;
                read_entry(cache, middle, local % INODE_INDIRECT_COUNT)
            }
        }
    }

    /// 将该层的数据块从 from 个扩充到 to 个, 新扇区从 batch 中依次取用.
    /// 用到的索引块只在内存中修改, 记录在 updates 中, 由 increase_size 统一写回.
    /// 返回实际达到的层内数据块数, batch 耗尽时会小于 to.
    fn grow(
        self,
        inode: &mut DiskInode,
        from: usize,
        to: usize,
        batch: &mut IntoIter<SectorId>,
        cache: &BlockCache,
        updates: &mut Vec<IndexUpdate>,
    ) -> Result<usize> {
        if from >= to {
            return Ok(from);
        }
        match self {
            IndexTier::Direct => Ok(fill(&mut inode.direct, from, to, batch)),
            IndexTier::Indirect => {
                let fresh = inode.indirect.is_unset();
                if !claim_index_block(&mut inode.indirect, batch, 1) {
                    return Ok(from);
                }
                let mut index = IndexUpdate::load(inode.indirect, fresh, cache)?;
                let reached = fill(&mut index.block, from, to, batch);
                updates.push(index);
                Ok(reached)
            }
            IndexTier::DoublyIndirect => {
                // 锚块之后至少还要能分配一个中间索引块和一个数据块
                let fresh = inode.doubly_indirect.is_unset();
                if !claim_index_block(&mut inode.doubly_indirect, batch, 2) {
                    return Ok(from);
                }
                let mut anchor = IndexUpdate::load(inode.doubly_indirect, fresh, cache)?;
                let mut reached = from;
                while reached < to {
                    let middle_pos = reached / INODE_INDIRECT_COUNT;
                    let middle_base = middle_pos * INODE_INDIRECT_COUNT;
                    let fresh = anchor.block[middle_pos].is_unset();
                    if !claim_index_block(&mut anchor.block[middle_pos], batch, 1) {
                        break;
                    }
                    let mut middle = IndexUpdate::load(anchor.block[middle_pos], fresh, cache)?;
                    let middle_to = (to - middle_base).min(INODE_INDIRECT_COUNT);
                    let filled = fill(&mut middle.block, reached - middle_base, middle_to, batch);
                    updates.push(middle);
                    reached = middle_base + filled;
                    if filled < middle_to {
                        break;
                    }
                }
                updates.push(anchor);
                Ok(reached)
            }
        }
    }

    /// 收集该层前 blocks 个数据块以及它们用到的索引块
    fn reclaim(
        self,
        inode: &DiskInode,
        blocks: usize,
        cache: &BlockCache,
        sectors: &mut Vec<SectorId>,
    ) -> Result<()> {
        if blocks == 0 {
            return Ok(());
        }
        match self {
            IndexTier::Direct => sectors.extend_from_slice(&inode.direct[..blocks]),
            IndexTier::Indirect => {
                let index = cache.read(inode.indirect, 0, |index: &IndexBlock| *index)?;
                sectors.extend_from_slice(&index[..blocks]);
                sectors.push(inode.indirect);
            }
            IndexTier::DoublyIndirect => {
                let anchor = cache.read(inode.doubly_indirect, 0, |index: &IndexBlock| *index)?;
                let middles = (blocks + INODE_INDIRECT_COUNT - 1) / INODE_INDIRECT_COUNT;
                for (middle_pos, &middle_sector) in anchor[..middles].iter().enumerate() {
                    let middle = cache.read(middle_sector, 0, |index: &IndexBlock| *index)?;
                    let count =
                        (blocks - middle_pos * INODE_INDIRECT_COUNT).min(INODE_INDIRECT_COUNT);
                    sectors.extend_from_slice(&middle[..count]);
                    sectors.push(middle_sector);
                }
                sectors.push(inode.doubly_indirect);
            }
        }
        Ok(())
    }
}

/// 扩容过程中对一个索引块的修改
struct IndexUpdate {
    sector: SectorId,
    block: IndexBlock,
    /// 本次扩容新分配的索引块, 还没有被任何已写回的结构引用
    fresh: bool,
}

impl IndexUpdate {
    /// 新分配的索引块从全 0 开始, 已有的索引块先复制一份
    fn load(sector: SectorId, fresh: bool, cache: &BlockCache) -> Result<Self> {
        let block = if fresh {
            [SectorId::UNSET; INODE_INDIRECT_COUNT]
        } else {
            cache.read(sector, 0, |index: &IndexBlock| *index)?
        };
        Ok(Self {
            sector,
            block,
            fresh,
        })
    }
}

fn read_entry(cache: &BlockCache, index: SectorId, pos: usize) -> Result<SectorId> {
    if index.is_unset() {
        return Ok(SectorId::UNSET);
    }
    cache.read(index, 0, |index: &IndexBlock| index[pos])
}

/// 从 batch 中取扇区填充 pointers[from..to], 返回填到的位置
fn fill(
    pointers: &mut [SectorId],
    from: usize,
    to: usize,
    batch: &mut IntoIter<SectorId>,
) -> usize {
    let mut reached = from;
    while reached < to {
        match batch.next() {
            Some(sector) => pointers[reached] = sector,
            None => break,
        }
        reached += 1;
    }
    reached
}

/// 索引块尚未分配时从 batch 中为它取一个扇区.
/// 只有取走之后 batch 中仍剩下至少 reserve 个扇区才会取, 不会分配出不指向任何数据的索引块.
fn claim_index_block(slot: &mut SectorId, batch: &mut IntoIter<SectorId>, reserve: usize) -> bool {
    if !slot.is_unset() {
        return true;
    }
    if batch.len() <= reserve {
        return false;
    }
    match batch.next() {
        Some(sector) => {
            *slot = sector;
            true
        }
        None => false,
    }
}

/// 每个 文件/目录 在磁盘上均以一个 DiskInode 的形式存储
///
/// 大小恰好为一个扇区: 123 * 4 + 4 + 4 + 4 + 4 + 3 + 1 = 512 B
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    /// 直接索引块(号组)
    pub direct: [SectorId; INODE_DIRECT_COUNT],
    /// 一级间接索引块(号)
    pub indirect: SectorId,
    /// 二级间接索引块(号)
    pub doubly_indirect: SectorId,
    /// 文件/目录内容的字节数
    length: u32,
    /// 用于合法性验证的魔数
    magic: u32,
    _reserved: [u8; 3],
    /// 非 0 表示目录
    is_dir: u8,
}

const _: () = assert!(mem::size_of::<DiskInode>() == BLOCK_SIZE);

impl Debug for DiskInode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskInode")
            .field("length", &self.length)
            .field("magic", &self.magic)
            .field("is_dir", &self.is_dir())
            .field("direct", &&self.direct[..self.data_blocks().min(INODE_DIRECT_COUNT)])
            .field("indirect", &self.indirect)
            .field("doubly_indirect", &self.doubly_indirect)
            .finish()
    }
}

impl DiskInode {
    /// 一个长度为 0 的新索引节点
    pub fn new(is_dir: bool) -> Self {
        Self {
            direct: [SectorId::UNSET; INODE_DIRECT_COUNT],
            indirect: SectorId::UNSET,
            doubly_indirect: SectorId::UNSET,
            length: 0,
            magic: INODE_MAGIC,
            _reserved: [0; 3],
            is_dir: u8::from(is_dir),
        }
    }

    /// 通过块缓存载入位于 sector 的索引节点, 并检查魔数
    pub fn load(cache: &BlockCache, sector: SectorId) -> Result<Self> {
        let disk_inode = cache.read(sector, 0, |disk_inode: &DiskInode| *disk_inode)?;
        if !disk_inode.is_valid() {
            error!(
                "corrupt extent record at sector {}: magic {:#010x}",
                sector, disk_inode.magic
            );
            return Err(FsError::CorruptRecord {
                sector,
                magic: disk_inode.magic,
            });
        }
        Ok(disk_inode)
    }

    /// 将索引节点写回位于 sector 的扇区 (经过块缓存)
    pub fn store(&self, cache: &BlockCache, sector: SectorId) -> Result<()> {
        cache.modify(sector, 0, |disk_inode: &mut DiskInode| *disk_inode = *self)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// 计算为了容纳自身 length 字节的内容需要多少个数据块
    pub fn data_blocks(&self) -> usize {
        Self::_data_blocks(self.length())
    }

    fn _data_blocks(size: usize) -> usize {
        (size + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    /// total_blocks 不仅包含数据块, 还需要统计索引块
    pub fn total_blocks(data_blocks: usize) -> usize {
        IndexTier::ALL
            .into_iter()
            .map(|tier| {
                let blocks = tier.blocks_in(data_blocks);
                blocks + tier.index_blocks(blocks)
            })
            .sum()
    }

    /// 计算将长度扩充到 new_size 需要额外多少个数据和索引块
    pub fn blocks_num_needed(&self, new_size: usize) -> usize {
        let target = Self::_data_blocks(new_size.min(MAX_FILE_SIZE));
        Self::total_blocks(target).saturating_sub(Self::total_blocks(self.data_blocks()))
    }

    /// 查到文件内第 block 个数据块的扇区编号; 超出容量或者尚未分配时返回 None
    pub fn get_block_id(&self, block: usize, cache: &BlockCache) -> Result<Option<SectorId>> {
        let Some((tier, local)) = IndexTier::locate(block) else {
            return Ok(None);
        };
        let sector = tier.resolve(self, local, cache)?;
        Ok(Some(sector).filter(|sector| !sector.is_unset()))
    }

    /// 查到字节偏移 offset 所在数据块的扇区; offset 不小于文件长度时没有数据
    pub fn resolve(&self, offset: usize, cache: &BlockCache) -> Result<Option<SectorId>> {
        if offset >= self.length() {
            return Ok(None);
        }
        self.get_block_id(offset / BLOCK_SIZE, cache)
    }

    /// 将长度扩充到 new_size, 并把索引节点写回位于 sector 的扇区
    ///
    /// new_blocks 是由分配器一次性分配的扇区 (已经清零), 依次拼接到直接索引,
    /// 一级间接索引, 二级间接索引中, 索引块本身也从中取用.
    /// 扇区不够时只推进到实际拿到的块数, 长度也只反映实际拿到的块.
    /// 返回没有用上的扇区, 由调用者归还给分配器.
    ///
    /// 返回错误时 self 以及已经链接的索引块都保持原样, new_blocks 可以整批归还.
    pub fn increase_size(
        &mut self,
        sector: SectorId,
        new_size: usize,
        new_blocks: Vec<SectorId>,
        cache: &BlockCache,
    ) -> Result<Vec<SectorId>> {
        let mut grown = *self;
        let current = self.data_blocks();
        let total = Self::_data_blocks(new_size).min(MAX_FILE_BLOCKS);
        let mut batch = new_blocks.into_iter();
        let mut updates = Vec::new();
        let mut secured = current;
        for tier in IndexTier::ALL {
            let from = tier.blocks_in(current);
            let to = tier.blocks_in(total);
            if from == to {
                continue;
            }
            let reached = tier.grow(&mut grown, from, to, &mut batch, cache, &mut updates)?;
            secured = tier.start() + reached;
            if reached < to {
                break;
            }
        }
        let new_length = if secured >= total {
            new_size.min(MAX_FILE_SIZE)
        } else {
            secured * BLOCK_SIZE
        };
        grown.length = grown.length.max(new_length as u32);

        // 新的索引块只有 grown 引用, 这里失败不会留下指向已归还扇区的指针
        for update in updates.iter().filter(|update| update.fresh) {
            cache.modify(update.sector, 0, |index: &mut IndexBlock| *index = update.block)?;
        }
        // 已经链接的索引块和索引节点先全部钉住, 之后的修改不会再失败
        let linked = updates
            .iter()
            .filter(|update| !update.fresh)
            .map(|update| cache.acquire(update.sector).map(|slot| (slot, &update.block)))
            .collect::<Result<Vec<_>>>()?;
        let record = cache.acquire(sector)?;
        for (slot, block) in linked {
            slot.modify(0, |index: &mut IndexBlock| *index = *block);
        }
        record.modify(0, |disk_inode: &mut DiskInode| *disk_inode = grown);
        *self = grown;
        Ok(batch.collect())
    }

    /// 收集文件占据的所有数据块和索引块
    ///
    /// 顺序: 直接索引的数据块, 一级索引的数据块及索引块,
    /// 二级索引每个中间索引块的数据块及中间索引块, 最后是二级索引块.
    pub fn reclaim(&self, cache: &BlockCache) -> Result<Vec<SectorId>> {
        let data_blocks = self.data_blocks();
        let mut sectors = Vec::with_capacity(Self::total_blocks(data_blocks));
        for tier in IndexTier::ALL {
            tier.reclaim(self, tier.blocks_in(data_blocks), cache, &mut sectors)?;
        }
        Ok(sectors)
    }

    /// 将文件内容从 offset 字节开始的部分读到内存中的缓冲区 buf 中, 并返回实际读到的字节数
    ///
    /// 如果文件剩下的内容还足够多, 那么缓冲区会被填满; 否则文件剩下的全部内容都会被读到缓冲区中
    pub fn read_at(&self, offset: usize, buf: &mut [u8], cache: &BlockCache) -> Result<usize> {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.length());
        if start >= end {
            return Ok(0);
        }
        let mut read_size = 0usize;

        loop {
            // 当前块的终止位置
            let end_current_block = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_read_size = end_current_block - start;
            let Some(sector) = self.get_block_id(start / BLOCK_SIZE, cache)? else {
                break;
            };
            let dst = &mut buf[read_size..read_size + block_read_size];
            cache.read_range(sector, start % BLOCK_SIZE, dst)?;
            read_size += block_read_size;

            if end_current_block == end {
                break;
            }
            // 转到下一个块
            start = end_current_block;
        }
        Ok(read_size)
    }

    /// 将数据写入已经分配好的范围
    ///
    /// 写入范围被截断到当前长度: 超出文件范围的部分需要调用者先 increase_size.
    pub fn write_at(&self, offset: usize, buf: &[u8], cache: &BlockCache) -> Result<usize> {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.length());
        if start >= end {
            return Ok(0);
        }
        let mut write_size = 0usize;

        loop {
            let end_current_block = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_write_size = end_current_block - start;
            let Some(sector) = self.get_block_id(start / BLOCK_SIZE, cache)? else {
                break;
            };
            let src = &buf[write_size..write_size + block_write_size];
            cache.write_range(sector, start % BLOCK_SIZE, src)?;
            write_size += block_write_size;

            if end_current_block == end {
                break;
            }
            start = end_current_block;
        }
        Ok(write_size)
    }
}
