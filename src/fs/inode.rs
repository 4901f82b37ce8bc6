//! 内存中的索引节点
//!
//! DiskInode 放在磁盘上固定的扇区中, 而 [`Inode`] 是放在内存中的记录索引节点打开状态的数据结构.
//! 同一个扇区无论被打开多少次, 都只对应一个 Inode, 由 [`InodeTable`] 按扇区编号登记并共享.
//!
//! 删除是延迟的: remove 只做标记, 最后一个打开者关闭时才回收全部扇区.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use log::{debug, warn};
use spin::Mutex;

use super::{
    Allocator, BlockCache, DiskInode, FsError, Result, SectorId, WriteGate, MAX_FILE_SIZE,
    ZERO_BLOCK,
};

/// 索引节点的生命周期
///
/// Open -> Removed (仍有打开者) -> 最后一次 close 时回收.
/// 只有 Removed 且打开计数为 0 时才会回收.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Lifecycle {
    Open,
    Removed,
}

struct InodeState {
    open_count: usize,
    lifecycle: Lifecycle,
}

pub struct Inode {
    /// 索引节点所在的扇区, 也就是它的编号
    sector: SectorId,
    is_dir: bool,
    state: Mutex<InodeState>,
    /// 串行化长度检查与索引扩容
    growth: StdMutex<()>,
    /// 目录层用来串行化目录项修改
    dir_lock: StdMutex<()>,
    write_gate: WriteGate,
    cache: Arc<BlockCache>,
    allocator: Arc<dyn Allocator>,
}

impl Inode {
    fn new(
        sector: SectorId,
        is_dir: bool,
        cache: Arc<BlockCache>,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        Self {
            sector,
            is_dir,
            state: Mutex::new(InodeState {
                open_count: 1,
                lifecycle: Lifecycle::Open,
            }),
            growth: StdMutex::new(()),
            dir_lock: StdMutex::new(()),
            write_gate: WriteGate::new(),
            cache,
            allocator,
        }
    }

    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Removed
    }

    /// 再打开一次同一个索引节点
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.state.lock().open_count += 1;
        Arc::clone(self)
    }

    /// 标记为删除, 磁盘上的内容在最后一个打开者关闭时才会回收
    pub fn remove(&self) {
        self.state.lock().lifecycle = Lifecycle::Removed;
    }

    /// 载入并校验磁盘上的索引节点
    pub fn disk_inode(&self) -> Result<DiskInode> {
        DiskInode::load(&self.cache, self.sector)
    }

    pub fn length(&self) -> Result<usize> {
        Ok(self.disk_inode()?.length())
    }

    /// 字节偏移 offset 所在的扇区; 不小于文件长度时返回 None
    pub fn resolve(&self, offset: usize) -> Result<Option<SectorId>> {
        self.disk_inode()?.resolve(offset, &self.cache)
    }

    /// 从 offset 开始读取至多 buf.len() 个字节, 返回实际读到的字节数
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.disk_inode()?.read_at(offset, buf, &self.cache)
    }

    /// 从 offset 开始写入 buf, 返回实际写入的字节数
    ///
    /// 写入越过文件末尾时先扩容. 分配器给出的扇区不够时, 只写到实际分配到的长度为止.
    /// 超出最大文件长度的部分被截掉, 完全在最大长度之外的写入不会改变文件.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize> {
        self.write_gate.wait_until_allowed();
        let end = offset.saturating_add(buf.len()).min(MAX_FILE_SIZE);
        if offset >= end {
            return Ok(0);
        }

        // 扩容锁只覆盖检查和扩充长度的部分, 之后的数据写入不持有它
        let size = {
            let _growth = self.growth.lock().unwrap_or_else(PoisonError::into_inner);
            let length = self.length()?;
            if end > length {
                self.extend(end)?.saturating_sub(offset).min(end - offset)
            } else {
                end - offset
            }
        };
        if size == 0 {
            return Ok(0);
        }
        self.disk_inode()?
            .write_at(offset, &buf[..size], &self.cache)
    }

    /// 将长度扩充到 new_length, 返回扩充之后的实际长度. 调用者持有扩容锁.
    fn extend(&self, new_length: usize) -> Result<usize> {
        let mut disk_inode = self.disk_inode()?;
        let blocks_needed = disk_inode.blocks_num_needed(new_length);
        let new_blocks = self.allocator.allocate(blocks_needed);
        if new_blocks.len() < blocks_needed {
            warn!(
                "inode {}: growth to {} bytes secured {} of {} sectors",
                self.sector,
                new_length,
                new_blocks.len(),
                blocks_needed
            );
        }

        // 新扇区先清零再链接进索引, 文件中的空洞读出来都是 0.
        // 失败时磁盘上的索引结构没有引用任何新扇区, 整批归还.
        let linked = new_blocks
            .iter()
            .try_for_each(|&sector| self.cache.write_block(sector, &ZERO_BLOCK))
            .and_then(|()| {
                disk_inode.increase_size(self.sector, new_length, new_blocks.clone(), &self.cache)
            });
        let unused = match linked {
            Ok(unused) => unused,
            Err(err) => {
                for &sector in new_blocks.iter() {
                    self.allocator.release(sector, 1);
                }
                return Err(err);
            }
        };
        for sector in unused {
            self.allocator.release(sector, 1);
        }
        debug!(
            "inode {}: length -> {} ({} new sectors)",
            self.sector,
            disk_inode.length(),
            new_blocks.len()
        );
        Ok(disk_inode.length())
    }

    pub fn deny_write(&self) {
        self.write_gate.deny();
        debug_assert!(self.write_gate.denials() <= self.open_count());
    }

    pub fn allow_write(&self) {
        debug_assert!(self.write_gate.denials() <= self.open_count());
        self.write_gate.allow();
    }

    pub fn deny_write_count(&self) -> usize {
        self.write_gate.denials()
    }

    /// 获取目录锁, guard 离开作用域时释放
    pub fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.dir_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 收集并归还全部数据块和索引块; with_record 为真时连同索引节点自身的扇区一起归还
    fn release_blocks(&self, with_record: bool) -> Result<usize> {
        let disk_inode = self.disk_inode()?;
        let mut sectors = disk_inode.reclaim(&self.cache)?;
        if with_record {
            sectors.push(self.sector);
        } else {
            DiskInode::new(self.is_dir).store(&self.cache, self.sector)?;
        }
        for &sector in sectors.iter() {
            self.allocator.release(sector, 1);
        }
        debug!(
            "inode {}: reclaimed {} sectors ({} bytes of data)",
            self.sector,
            sectors.len(),
            disk_inode.length()
        );
        Ok(sectors.len())
    }
}

/// 打开的索引节点登记表
pub struct InodeTable {
    cache: Arc<BlockCache>,
    allocator: Arc<dyn Allocator>,
    /// 扇区编号 -> 共享的 Inode
    open_inodes: Mutex<BTreeMap<SectorId, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new(cache: Arc<BlockCache>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            cache,
            allocator,
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// 在 sector 上初始化一个索引节点, 内容为 initial_length 个 0 字节
    ///
    /// 分配器无法提供完整的初始长度时, 已分配的扇区被归还, 返回 [`FsError::NoSpace`].
    /// sector 本身属于调用者, 不会被归还.
    pub fn create(&self, sector: SectorId, initial_length: usize, is_dir: bool) -> Result<()> {
        self.cache.write_block(sector, &ZERO_BLOCK)?;
        DiskInode::new(is_dir).store(&self.cache, sector)?;
        if initial_length == 0 {
            return Ok(());
        }

        let inode = self.open(sector)?;
        let grown = {
            let _growth = inode.growth.lock().unwrap_or_else(PoisonError::into_inner);
            inode.extend(initial_length)
        };
        let result = match grown {
            Ok(length) if length >= initial_length => Ok(()),
            Ok(length) => inode.release_blocks(false).and(Err(FsError::NoSpace {
                requested: initial_length,
                secured: length,
            })),
            Err(err) => Err(err),
        };
        self.close(inode)?;
        result
    }

    /// 打开位于 sector 的索引节点; 如果已经打开, 返回同一个 Inode 并增加打开计数
    pub fn open(&self, sector: SectorId) -> Result<Arc<Inode>> {
        let mut open_inodes = self.open_inodes.lock();
        if let Some(inode) = open_inodes.get(&sector) {
            inode.state.lock().open_count += 1;
            return Ok(Arc::clone(inode));
        }
        let disk_inode = DiskInode::load(&self.cache, sector)?;
        let inode = Arc::new(Inode::new(
            sector,
            disk_inode.is_dir(),
            Arc::clone(&self.cache),
            Arc::clone(&self.allocator),
        ));
        open_inodes.insert(sector, Arc::clone(&inode));
        Ok(inode)
    }

    /// 关闭一个打开者
    ///
    /// 打开计数归零时从登记表中移除; 如果已被标记删除, 归还它的全部扇区.
    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        let reclaim = {
            let mut open_inodes = self.open_inodes.lock();
            let mut state = inode.state.lock();
            debug_assert!(state.open_count > 0, "close of a closed inode");
            state.open_count -= 1;
            if state.open_count > 0 {
                return Ok(());
            }
            open_inodes.remove(&inode.sector);
            state.lifecycle == Lifecycle::Removed
        };
        if reclaim {
            inode.release_blocks(true)?;
        }
        Ok(())
    }

    /// 当前打开的索引节点数量
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }

    pub fn is_open(&self, sector: SectorId) -> bool {
        self.open_inodes.lock().contains_key(&sector)
    }
}
