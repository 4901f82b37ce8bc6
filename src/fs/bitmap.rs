//! 空闲扇区位图 (free map)
//!
//! 每个 bit 代表一个扇区的分配状态, 0 意味着未分配, 而 1 则意味着已经分配出去.
//! 位图所要做的事情是通过基于 bit 为单位的分配(寻找一个为 0 的 bit 位并设置为 1)
//! 和回收(将bit位清零)来进行扇区的分配和回收.
//!
//! 索引节点层只通过 [`Allocator`] 使用它, 不对分配的位置做任何局部性假设.

use log::{debug, warn};
use spin::Mutex;

use super::SectorId;

/// 扇区分配器
pub trait Allocator: Send + Sync {
    /// 尽力分配 count 个扇区, 返回实际分配到的扇区 (可能少于 count 个, 不会无限阻塞)
    fn allocate(&self, count: usize) -> Vec<SectorId>;

    /// 回收从 sector 开始的连续 count 个扇区
    fn release(&self, sector: SectorId, count: usize);
}

/// 位图按 64 bits 一组进行操作, 一组打包在一个 u64 中
type BitGroup = u64;

/// FreeMap 驻留在内存中, 表示整个设备上每个扇区的分配情况.
pub struct FreeMap {
    /// 位图中的 bit 组
    groups: Mutex<Vec<BitGroup>>,
    /// 设备的扇区总数
    total_sectors: usize,
}

impl FreeMap {
    /// 创建一个覆盖 total_sectors 个扇区的位图.
    /// 0 号扇区被保留: 磁盘上值为 0 的指针表示未分配.
    pub fn new(total_sectors: usize) -> Self {
        let mut groups = vec![0; (total_sectors + 63) / 64];
        // 超出设备范围的 bit 预先置 1, 分配时就不会越界
        for bit in total_sectors..groups.len() * 64 {
            groups[bit / 64] |= 1 << (bit % 64);
        }
        let map = Self {
            groups: Mutex::new(groups),
            total_sectors,
        };
        map.mark_used(SectorId::UNSET);
        map
    }

    /// 将一个固定位置的扇区标记为已分配 (比如格式化时就确定的根目录索引节点)
    pub fn mark_used(&self, sector: SectorId) {
        let (group, inner) = decomposition(sector);
        self.groups.lock()[group] |= 1 << inner;
    }

    pub fn is_allocated(&self, sector: SectorId) -> bool {
        let (group, inner) = decomposition(sector);
        self.groups.lock()[group] & (1 << inner) != 0
    }

    /// 尚未分配的扇区数量
    pub fn free_count(&self) -> usize {
        self.groups
            .lock()
            .iter()
            .map(|group| group.count_zeros() as usize)
            .sum()
    }

    pub fn total_sectors(&self) -> usize {
        self.total_sectors
    }

    /// 在位图中分配一个 bit
    ///
    /// 以 bit 组(每组 64 bits)为单位进行遍历, 找到一个尚未被全部分配出去的组,
    /// 再通过 u64::trailing_ones 找到组内最低的一个 0 并置 1.
    fn alloc_one(groups: &mut [BitGroup]) -> Option<SectorId> {
        let (group_pos, inner_pos) = groups
            .iter()
            .enumerate()
            .find(|(_, group)| **group != BitGroup::MAX)
            .map(|(group_pos, group)| (group_pos, group.trailing_ones() as usize))?;
        groups[group_pos] |= 1 << inner_pos;
        Some(SectorId::new((group_pos * 64 + inner_pos) as u32))
    }
}

impl Allocator for FreeMap {
    fn allocate(&self, count: usize) -> Vec<SectorId> {
        let mut groups = self.groups.lock();
        let mut sectors = Vec::with_capacity(count);
        while sectors.len() < count {
            match Self::alloc_one(&mut groups) {
                Some(sector) => sectors.push(sector),
                None => break,
            }
        }
        if sectors.len() < count {
            warn!(
                "free map: requested {} sectors, only {} available",
                count,
                sectors.len()
            );
        }
        sectors
    }

    fn release(&self, sector: SectorId, count: usize) {
        let mut groups = self.groups.lock();
        for raw in sector.raw()..sector.raw() + count as u32 {
            let (group, inner) = decomposition(SectorId::new(raw));
            assert!(
                groups[group] & (1 << inner) != 0,
                "release of unallocated sector {}",
                raw
            );
            groups[group] &= !(1u64 << inner);
        }
        debug!("free map: released {} sector(s) from {}", count, sector);
    }
}

/// 将扇区编号分解为 bit 组的编号以及组内编号
fn decomposition(sector: SectorId) -> (usize, usize) {
    let bit = sector.raw() as usize;
    (bit / 64, bit % 64)
}
