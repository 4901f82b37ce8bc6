//! 块缓存层: 在内存中缓存磁盘块的数据, 避免频繁读写磁盘
//!
//! 缓存池 [`BlockCache`] 由固定数量的槽位组成, 槽位数在创建时确定.
//! 每个槽位可以容纳一个扇区的数据, 任意时刻一个扇区最多只会驻留在一个槽位中.
//!
//! 并发上分为两层锁:
//!
//! - 池锁 (table): 保护扇区到槽位的映射, 钉住计数 (pin_count), 时钟指针和访问位.
//!   池锁只在查找, 时钟扫描和认领槽位这些 O(1) 的簿记操作期间持有, 从不跨越设备 I/O.
//! - 槽位锁 (buffers[i]): 槽位数据的独占访问权. 设备读写 (载入/写回) 都在槽位锁内完成,
//!   同一个扇区的访问在它上面串行化, 不同扇区的访问互不干扰.
//!
//! 持有池锁时绝不会等待某个槽位锁 (只会 try_lock), 因此两层锁之间不会死锁.
//!
//! 替换算法使用时钟 (second-chance) 算法: 钉住计数大于 0 的槽位永远不会被选中,
//! 访问位为 1 的槽位会被清零并再给一次机会.

use std::{mem, sync::Arc, thread};

use log::{debug, info, trace, warn};
use spin::{Mutex, MutexGuard};

use super::{BlockDevice, FsError, OnDisk, Result, SectorId, BLOCK_CACHE_SIZE, BLOCK_SIZE};

/// 一个块大小的缓冲区. 按 8 字节对齐, 使得磁盘数据结构可以直接在上面解释.
#[repr(C, align(8))]
struct BlockData([u8; BLOCK_SIZE]);

/// 槽位在池中的状态
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    /// 尚未映射任何扇区
    Empty,
    /// 已被时钟扫描认领并改派给 sector, 但原扇区 victim 的脏数据可能仍在写回途中
    Claimed { sector: SectorId, victim: SectorId },
    /// 映射到一个扇区
    Resident(SectorId),
}

impl SlotState {
    fn sector(self) -> Option<SectorId> {
        match self {
            SlotState::Empty => None,
            SlotState::Claimed { sector, .. } | SlotState::Resident(sector) => Some(sector),
        }
    }
}

/// 池锁保护的槽位元数据
struct SlotMeta {
    state: SlotState,
    /// 正在使用该槽位的操作数量, 大于 0 时不可被替换
    pin_count: usize,
    /// 时钟算法的访问位
    reference: bool,
}

struct SlotTable {
    meta: Vec<SlotMeta>,
    /// 时钟指针
    hand: usize,
}

/// 时钟扫描的结果
enum Scan<'a> {
    /// 选中的槽位, 以及它的槽位锁
    Victim(usize, MutexGuard<'a, SlotBuffer>),
    /// 有未被钉住的槽位, 但它的槽位锁暂时被占用
    Busy,
    /// 所有槽位都被钉住
    Exhausted,
}

/// 查找一个扇区时的结果
enum Probe {
    /// 扇区驻留在这个槽位中
    Hit(usize),
    /// 扇区是这个槽位正在写回的 victim
    InFlight(usize),
    Miss,
}

impl SlotTable {
    fn probe(&self, sector: SectorId) -> Probe {
        for (i, meta) in self.meta.iter().enumerate() {
            match meta.state {
                SlotState::Claimed { victim, .. } if victim == sector => return Probe::InFlight(i),
                state if state.sector() == Some(sector) => return Probe::Hit(i),
                _ => {}
            }
        }
        Probe::Miss
    }

    fn pin(&mut self, index: usize) {
        self.meta[index].pin_count += 1;
    }
}

/// Cached block inside memory
struct SlotBuffer {
    /// 缓冲区内容所属的扇区
    sector: Option<SectorId>,
    /// data 是否与设备上的内容一致 (改派之后, 第一次载入之前为 false)
    valid: bool,
    /// data 自载入之后有没有被修改过
    dirty: bool,
    data: BlockData,
}

impl SlotBuffer {
    fn empty() -> Self {
        Self {
            sector: None,
            valid: false,
            dirty: false,
            data: BlockData([0; BLOCK_SIZE]),
        }
    }

    /// 获取缓冲区中的位于偏移量 offset 的一个类型为 T 的磁盘上数据结构的不可变引用.
    fn get_ref<T: OnDisk>(&self, offset: usize) -> &T {
        let type_size = mem::size_of::<T>();
        // 确认 T 被整个包含在磁盘块及其缓冲区之内
        assert!(offset + type_size <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0, "misaligned on-disk access");
        // SAFETY: 范围和对齐已检查, OnDisk 保证任意字节序列都是 T 的合法值
        unsafe { &*(self.data.0.as_ptr().add(offset) as *const T) }
    }

    /// 获取可变引用, 并将缓冲区标记为脏
    fn get_mut<T: OnDisk>(&mut self, offset: usize) -> &mut T {
        let type_size = mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0, "misaligned on-disk access");
        self.dirty = true;
        // SAFETY: 同 get_ref, 且 &mut self 保证独占
        unsafe { &mut *(self.data.0.as_mut_ptr().add(offset) as *mut T) }
    }

    /// 如果被修改过, 写回磁盘
    fn sync(&mut self, device: &dyn BlockDevice) {
        if let Some(sector) = self.sector {
            if self.dirty && self.valid {
                trace!("block cache: write back sector {}", sector);
                device.write_block(sector, &self.data.0);
                self.dirty = false;
            }
        }
    }

    /// 让缓冲区改为承载 sector: 原扇区的脏数据先写回, 新内容标记为尚未载入
    fn reassign(&mut self, sector: SectorId, device: &dyn BlockDevice) {
        if self.sector == Some(sector) {
            return;
        }
        if let Some(old) = self.sector {
            if self.dirty && self.valid {
                debug!("block cache: evict dirty sector {} for {}", old, sector);
            }
        }
        self.sync(device);
        self.sector = Some(sector);
        self.valid = false;
        self.dirty = false;
    }
}

/// 块缓存池
///
/// 对于其他模块而言, 可以直接通过 [`BlockCache::acquire`] 请求一个钉住的槽位,
/// 或者通过 read/modify/read_range/write_range 一次性完成访问.
pub struct BlockCache {
    block_device: Arc<dyn BlockDevice>,
    buffers: Vec<Mutex<SlotBuffer>>,
    table: Mutex<SlotTable>,
}

impl BlockCache {
    /// 创建一个含有 slots 个空槽位的缓存池
    pub fn new(block_device: Arc<dyn BlockDevice>, slots: usize) -> Self {
        assert!(slots > 0, "block cache needs at least one slot");
        Self {
            block_device,
            buffers: (0..slots).map(|_| Mutex::new(SlotBuffer::empty())).collect(),
            table: Mutex::new(SlotTable {
                meta: (0..slots)
                    .map(|_| SlotMeta {
                        state: SlotState::Empty,
                        pin_count: 0,
                        reference: false,
                    })
                    .collect(),
                hand: 0,
            }),
        }
    }

    pub fn with_default_size(block_device: Arc<dyn BlockDevice>) -> Self {
        Self::new(block_device, BLOCK_CACHE_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn block_device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }

    /// 查找扇区所在的槽位, 命中时钉住并返回它
    pub fn lookup(&self, sector: SectorId) -> Option<PinnedSlot<'_>> {
        loop {
            let mut table = self.table.lock();
            match table.probe(sector) {
                Probe::Hit(index) => {
                    table.pin(index);
                    return Some(PinnedSlot::new(self, index, sector));
                }
                Probe::InFlight(index) => {
                    drop(table);
                    self.wait_write_back(index);
                }
                Probe::Miss => return None,
            }
        }
    }

    /// 得到一个承载 sector 的钉住的槽位
    ///
    /// 命中则直接返回; 否则优先使用空槽位, 没有空槽位时运行时钟替换算法.
    /// 扫描至多两轮, 所有槽位都被钉住时返回 [`FsError::ResourceExhausted`].
    /// 查找和认领在同一段池锁临界区内完成, 所以并发的请求不会为同一个扇区建立两个槽位.
    pub fn acquire(&self, sector: SectorId) -> Result<PinnedSlot<'_>> {
        loop {
            let mut table = self.table.lock();
            match table.probe(sector) {
                Probe::Hit(index) => {
                    table.pin(index);
                    return Ok(PinnedSlot::new(self, index, sector));
                }
                Probe::InFlight(index) => {
                    drop(table);
                    self.wait_write_back(index);
                    continue;
                }
                Probe::Miss => {}
            }

            if let Some(index) = table
                .meta
                .iter()
                .position(|meta| meta.state == SlotState::Empty)
            {
                let meta = &mut table.meta[index];
                meta.state = SlotState::Resident(sector);
                meta.pin_count = 1;
                meta.reference = false;
                return Ok(PinnedSlot::new(self, index, sector));
            }

            let (index, mut buffer) = match self.select_victim(&mut table) {
                Scan::Victim(index, buffer) => (index, buffer),
                Scan::Busy => {
                    // 没有被钉住的槽位正被 flush_all 或者等待写回的线程短暂持有, 稍后重试
                    drop(table);
                    thread::yield_now();
                    continue;
                }
                Scan::Exhausted => {
                    warn!("block cache: all {} slots are pinned", self.capacity());
                    return Err(FsError::ResourceExhausted);
                }
            };
            let meta = &mut table.meta[index];
            meta.state = match meta.state.sector() {
                Some(victim) => SlotState::Claimed { sector, victim },
                None => SlotState::Resident(sector),
            };
            meta.pin_count = 1;
            meta.reference = false;
            drop(table);

            // 写回在池锁之外进行; 槽位锁在认领时已经拿到, 别人看不到写了一半的缓冲区
            buffer.reassign(sector, self.block_device.as_ref());
            drop(buffer);
            self.table.lock().meta[index].state = SlotState::Resident(sector);
            return Ok(PinnedSlot::new(self, index, sector));
        }
    }

    /// 时钟扫描, 调用者持有池锁
    ///
    /// 钉住计数为 0 的槽位没有访问者持有它的槽位锁, 因此 try_lock 通常会成功;
    /// 失败说明 flush_all 或者某个等待写回的线程正短暂地持有它. 这样的槽位本轮跳过,
    /// 扫描结束仍没有选中时返回 [`Scan::Busy`], 而不是当作全部被钉住.
    fn select_victim<'a>(&'a self, table: &mut SlotTable) -> Scan<'a> {
        let slots = table.meta.len();
        let mut busy = false;
        for _ in 0..2 * slots {
            let index = table.hand;
            table.hand = (index + 1) % slots;
            let meta = &mut table.meta[index];
            if meta.pin_count > 0 {
                continue;
            }
            if meta.reference {
                meta.reference = false;
                continue;
            }
            match self.buffers[index].try_lock() {
                Some(buffer) => return Scan::Victim(index, buffer),
                None => busy = true,
            }
        }
        if busy {
            Scan::Busy
        } else {
            Scan::Exhausted
        }
    }

    /// 等待某个槽位上正在进行的写回结束
    fn wait_write_back(&self, index: usize) {
        drop(self.buffers[index].lock());
        core::hint::spin_loop();
    }

    fn unpin(&self, index: usize) {
        let mut table = self.table.lock();
        let meta = &mut table.meta[index];
        debug_assert!(meta.pin_count > 0, "unpin of an unpinned slot");
        meta.pin_count -= 1;
        meta.reference = true;
    }

    /// 在扇区 sector 偏移量为 offset 的位置获取一个类型为 T 的磁盘上数据结构的不可变引用,
    /// 并让它执行传入的闭包 f 中所定义的操作.
    pub fn read<T: OnDisk, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> Result<V> {
        Ok(self.acquire(sector)?.read(offset, f))
    }

    /// 同 read, 但获取的是可变引用, 槽位会被标记为脏
    pub fn modify<T: OnDisk, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> Result<V> {
        Ok(self.acquire(sector)?.modify(offset, f))
    }

    /// 将扇区中从 sector_offset 开始的 dst.len() 个字节复制到 dst
    pub fn read_range(&self, sector: SectorId, sector_offset: usize, dst: &mut [u8]) -> Result<()> {
        self.acquire(sector)?.read_bytes(sector_offset, dst);
        Ok(())
    }

    /// 将 src 复制到扇区中从 sector_offset 开始的位置
    pub fn write_range(&self, sector: SectorId, sector_offset: usize, src: &[u8]) -> Result<()> {
        self.acquire(sector)?.write_bytes(sector_offset, src);
        Ok(())
    }

    pub fn read_block(&self, sector: SectorId, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.read_range(sector, 0, dst)
    }

    /// 覆盖整个扇区, 不需要先从设备载入
    pub fn write_block(&self, sector: SectorId, src: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.write_range(sector, 0, src)
    }

    /// 将所有驻留且被修改过的槽位写回设备
    pub fn flush_all(&self) {
        for buffer in self.buffers.iter() {
            buffer.lock().sync(self.block_device.as_ref());
        }
    }

    /// 卸载时调用: 写回全部脏数据
    pub fn close(&self) {
        self.flush_all();
        info!("block cache: closed ({} slots)", self.capacity());
    }

    /// 每个槽位当前映射的扇区以及钉住计数
    pub(crate) fn slot_snapshot(&self) -> Vec<(Option<SectorId>, usize)> {
        self.table
            .lock()
            .meta
            .iter()
            .map(|meta| (meta.state.sector(), meta.pin_count))
            .collect()
    }
}

impl Drop for BlockCache {
    /// 缓存池被销毁之前, 所有脏数据都必须写回磁盘
    fn drop(&mut self) {
        self.flush_all();
    }
}

/// 一个被钉住的槽位
///
/// 持有期间该槽位不会被替换; drop 时自动解除钉住并置位访问位.
/// 每次访问都会获取槽位锁, 如有必要先从设备载入内容.
pub struct PinnedSlot<'a> {
    cache: &'a BlockCache,
    index: usize,
    sector: SectorId,
}

impl<'a> PinnedSlot<'a> {
    fn new(cache: &'a BlockCache, index: usize, sector: SectorId) -> Self {
        Self {
            cache,
            index,
            sector,
        }
    }

    pub fn sector(&self) -> SectorId {
        self.sector
    }

    /// 在槽位锁内访问缓冲区; overwrite 为真表示调用者会覆盖整个块, 不需要载入
    fn access<V>(&self, overwrite: bool, f: impl FnOnce(&mut SlotBuffer) -> V) -> V {
        let device = self.cache.block_device.as_ref();
        let mut buffer = self.cache.buffers[self.index].lock();
        buffer.reassign(self.sector, device);
        if !buffer.valid && !overwrite {
            device.read_block(self.sector, &mut buffer.data.0);
            buffer.valid = true;
            buffer.dirty = false;
        }
        f(&mut buffer)
    }

    pub fn read<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        self.access(false, |buffer| f(buffer.get_ref(offset)))
    }

    pub fn modify<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        self.access(false, |buffer| f(buffer.get_mut(offset)))
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= BLOCK_SIZE);
        self.access(false, |buffer| {
            dst.copy_from_slice(&buffer.data.0[offset..offset + dst.len()])
        })
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= BLOCK_SIZE);
        let whole = offset == 0 && src.len() == BLOCK_SIZE;
        self.access(whole, |buffer| {
            buffer.data.0[offset..offset + src.len()].copy_from_slice(src);
            buffer.valid = true;
            buffer.dirty = true;
        })
    }
}

impl Drop for PinnedSlot<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.index);
    }
}
