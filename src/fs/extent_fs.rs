//! 文件系统的装载与卸载
//!
//! [`ExtentFileSystem`] 把块设备, 块缓存, 空闲扇区位图和打开的索引节点登记表组合在一起,
//! 它们的生命周期从 mount 开始, 到 unmount 结束.

use std::sync::Arc;

use log::info;

use super::{
    Allocator, BlockCache, BlockDevice, FreeMap, FsError, Inode, InodeTable, Result, SectorId,
};

pub struct ExtentFileSystem {
    /// 保留块设备的一个指针, 块缓存通过它进行块读写
    pub block_device: Arc<dyn BlockDevice>,
    cache: Arc<BlockCache>,
    free_map: Arc<FreeMap>,
    inodes: InodeTable,
}

impl ExtentFileSystem {
    /// 在一个有 total_sectors 个扇区的块设备上装载文件系统, 块缓存有 cache_slots 个槽位
    pub fn mount(
        block_device: Arc<dyn BlockDevice>,
        total_sectors: usize,
        cache_slots: usize,
    ) -> Self {
        let cache = Arc::new(BlockCache::new(Arc::clone(&block_device), cache_slots));
        let free_map = Arc::new(FreeMap::new(total_sectors));
        let allocator: Arc<dyn Allocator> = free_map.clone();
        let inodes = InodeTable::new(Arc::clone(&cache), allocator);
        info!(
            "mounted: {} sectors, {} cache slots",
            total_sectors, cache_slots
        );
        Self {
            block_device,
            cache,
            free_map,
            inodes,
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn free_map(&self) -> &Arc<FreeMap> {
        &self.free_map
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// 分配一个扇区并在上面创建长度为 initial_length 的文件/目录, 返回它的扇区编号
    pub fn create(&self, initial_length: usize, is_dir: bool) -> Result<SectorId> {
        let sector = self
            .free_map
            .allocate(1)
            .pop()
            .ok_or(FsError::NoSpace {
                requested: initial_length,
                secured: 0,
            })?;
        if let Err(err) = self.inodes.create(sector, initial_length, is_dir) {
            self.free_map.release(sector, 1);
            return Err(err);
        }
        Ok(sector)
    }

    pub fn open(&self, sector: SectorId) -> Result<Arc<Inode>> {
        self.inodes.open(sector)
    }

    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        self.inodes.close(inode)
    }

    /// 标记删除, 最后一个打开者关闭时回收
    pub fn remove(&self, inode: &Inode) {
        inode.remove();
    }

    /// 卸载: 将块缓存中的脏数据全部写回
    pub fn unmount(self) {
        if self.inodes.open_inodes() > 0 {
            info!(
                "unmounting with {} inode(s) still open",
                self.inodes.open_inodes()
            );
        }
        self.cache.close();
        info!("unmounted: {} sectors free", self.free_map.free_count());
    }
}
