//! 禁止写入闸门
//!
//! 正在运行的可执行文件不允许被写入: 打开者调用 deny 增加计数, 调用 allow 减少计数.
//! 写者在计数大于 0 时阻塞, 直到计数回到 0 时被全部唤醒 (广播), 不需要轮询.
//! 写者自身从不修改计数.

use std::sync::{Condvar, Mutex, PoisonError};

pub struct WriteGate {
    /// 当前禁止写入的打开者数量
    denials: Mutex<usize>,
    /// 计数回到 0 时广播
    allowed: Condvar,
}

impl WriteGate {
    pub fn new() -> Self {
        Self {
            denials: Mutex::new(0),
            allowed: Condvar::new(),
        }
    }

    pub fn deny(&self) {
        *self.denials.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    /// 撤销一次 deny; 计数回到 0 时唤醒所有等待的写者
    pub fn allow(&self) {
        let mut denials = self.denials.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(*denials > 0, "allow_write without a matching deny_write");
        *denials -= 1;
        if *denials == 0 {
            self.allowed.notify_all();
        }
    }

    pub fn denials(&self) -> usize {
        *self.denials.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 阻塞直到没有任何打开者禁止写入
    pub fn wait_until_allowed(&self) {
        let denials = self.denials.lock().unwrap_or_else(PoisonError::into_inner);
        drop(
            self.allowed
                .wait_while(denials, |denials| *denials > 0)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new()
    }
}
