use thiserror::Error;

use super::SectorId;

/// 存储引擎向调用者报告的错误
///
/// 分配不足和越界读并不是错误: 它们表现为比请求更少的传输字节数.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    /// 时钟扫描两轮仍找不到可回收的槽位 (所有槽位都被钉住)
    #[error("block cache exhausted: every slot is pinned")]
    ResourceExhausted,

    /// 载入索引节点时魔数不匹配
    #[error("corrupt extent record at sector {sector}: magic {magic:#010x}")]
    CorruptRecord { sector: SectorId, magic: u32 },

    /// 创建文件时无法得到初始长度所需的全部扇区
    #[error("no space: requested {requested} bytes, secured {secured}")]
    NoSpace { requested: usize, secured: usize },
}

pub type Result<T> = core::result::Result<T, FsError>;
