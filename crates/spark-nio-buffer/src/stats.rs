use std::sync::atomic::{AtomicU64, Ordering};

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 未命中、向底层分配器新申请的次数。
    pub allocations: u64,
    /// 命中空闲链表的次数。
    pub reuses: u64,
    /// 成功入池的归还次数。
    pub pooled_frees: u64,
    /// 直接交还底层分配器的次数（只读、低于下限、超上限、池已关闭或无对应桶）。
    pub released: u64,
    /// 被淘汰扫描释放的条目数。
    pub evicted: u64,
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    allocations: AtomicU64,
    reuses: AtomicU64,
    pooled_frees: AtomicU64,
    released: AtomicU64,
    evicted: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn on_allocate(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_pooled(&self) {
        self.pooled_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_evict(&self, count: u64) {
        self.evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            pooled_frees: self.pooled_frees.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
