use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::allocator::{BufferAllocator, HeapAllocator};
use crate::buffer::Buffer;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::stats::{PoolCounters, PoolStats};
use crate::sweeper;

/// 按容量分桶、带过期时间的缓冲池。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 事件循环每次读取都要一块固定容量的缓冲，TLS 适配器也频繁申请同尺寸的明文/密文缓冲；
///   复用同容量的块可以把分配成本摊薄到接近零；
/// - 空闲期依靠 TTL 逐步释放，使池的额外内存最终回落为零。
///
/// ## 逻辑（How）
/// - `DashMap<usize, Arc<Bucket>>` 以容量为键，每个桶内部是一把 `parking_lot::Mutex`
///   保护的双端队列；
/// - 归还时压入队首并打上 `now + ttl` 的过期戳，分配时从队首弹出，
///   因此最近归还的缓冲最先被复用；
/// - 淘汰从队尾（最旧）开始逐个弹出，每次弹出只持锁一次 O(1) 操作，
///   释放动作在锁外完成。
///
/// ## 契约（What）
/// - `allocate(C)` 返回的缓冲满足 `position() == 0`、`capacity() == C`；
/// - `free` 接收 `None` 时什么也不做；只读缓冲直接交给底层分配器；
/// - 仅当池处于开启状态、桶已存在、桶长度低于上限且容量不低于下限时才会入池；
/// - `close` 之后拒绝任何新的入池，已入池条目仍可被分配，直到被自然淘汰。
///
/// ## 风险与权衡（Trade-offs）
/// - 桶在首次 `allocate` 时创建，此后常驻；容量种类应当有限（配合 `size_for` 取整）；
/// - 淘汰线程只持有弱引用，所有句柄释放后最多一个扫描周期内退出。
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    buckets: DashMap<usize, Arc<Bucket>>,
    allocator: Arc<dyn BufferAllocator>,
    config: PoolConfig,
    closed: AtomicBool,
    counters: PoolCounters,
}

#[derive(Default)]
struct Bucket {
    entries: Mutex<VecDeque<Pooled>>,
}

struct Pooled {
    storage: BytesMut,
    expires_at: Instant,
}

impl BufferPool {
    /// 以堆分配器构造池。
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_allocator(config, Arc::new(HeapAllocator))
    }

    /// 以自定义底层分配器构造池，并按配置启动后台淘汰线程。
    pub fn with_allocator(
        config: PoolConfig,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let spawn = config.spawn_sweeper;
        let interval = config.sweep_interval;
        let inner = Arc::new(PoolInner {
            buckets: DashMap::new(),
            allocator,
            config,
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        });
        if spawn {
            sweeper::spawn(Arc::downgrade(&inner), interval).map_err(PoolError::Spawn)?;
        }
        Ok(Self { inner })
    }

    /// 租借一块容量为 `capacity` 的空缓冲。
    pub fn allocate(&self, capacity: usize) -> Buffer {
        let bucket = self.inner.bucket_or_create(capacity);
        let reused = bucket.entries.lock().pop_front();
        match reused {
            Some(entry) => {
                self.inner.counters.on_reuse();
                Buffer::from_storage(entry.storage, capacity)
            }
            None => {
                self.inner.counters.on_allocate();
                Buffer::from_storage(self.inner.allocator.allocate(capacity), capacity)
            }
        }
    }

    /// 归还缓冲。
    pub fn free(&self, buffer: impl Into<Option<Buffer>>) {
        let Some(buffer) = buffer.into() else {
            return;
        };
        let (storage, capacity) = match buffer.into_storage() {
            Ok(parts) => parts,
            Err(read_only) => {
                self.inner.release(read_only);
                return;
            }
        };
        if !self.inner.accepts(capacity) {
            self.inner.release_storage(storage, capacity);
            return;
        }
        let Some(bucket) = self.inner.bucket(capacity) else {
            self.inner.release_storage(storage, capacity);
            return;
        };

        let entry = Pooled {
            storage,
            expires_at: Instant::now() + self.inner.config.ttl,
        };
        let rejected = {
            let mut entries = bucket.entries.lock();
            if entries.len() < self.inner.config.max_per_bucket {
                entries.push_front(entry);
                None
            } else {
                Some(entry)
            }
        };
        match rejected {
            None => self.inner.counters.on_pooled(),
            Some(entry) => self.inner.release_storage(entry.storage, capacity),
        }
    }

    /// 关闭池：此后不再接收任何入池请求。
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(pooled = self.total_pooled(), "buffer pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 指定容量桶当前的空闲条目数。
    pub fn pooled(&self, capacity: usize) -> usize {
        self.inner
            .bucket(capacity)
            .map_or(0, |bucket| bucket.entries.lock().len())
    }

    /// 所有桶的空闲条目总数。
    pub fn total_pooled(&self) -> usize {
        self.inner.total_pooled()
    }

    /// 同步执行一轮淘汰扫描，返回释放的条目数。
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired(Instant::now())
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buckets", &self.inner.buckets.len())
            .field("pooled", &self.total_pooled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PoolInner {
    fn bucket(&self, capacity: usize) -> Option<Arc<Bucket>> {
        self.buckets
            .get(&capacity)
            .map(|bucket| Arc::clone(bucket.value()))
    }

    fn bucket_or_create(&self, capacity: usize) -> Arc<Bucket> {
        if let Some(bucket) = self.bucket(capacity) {
            return bucket;
        }
        Arc::clone(self.buckets.entry(capacity).or_default().value())
    }

    fn accepts(&self, capacity: usize) -> bool {
        !self.closed.load(Ordering::Acquire) && capacity >= self.config.min_pooled_capacity
    }

    fn release(&self, buffer: Buffer) {
        self.counters.on_release();
        self.allocator.release(buffer);
    }

    fn release_storage(&self, storage: BytesMut, capacity: usize) {
        self.release(Buffer::from_storage(storage, capacity));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn total_pooled(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.value().entries.lock().len())
            .sum()
    }

    /// 从每个桶的队尾弹出过期条目并在锁外释放。
    pub(crate) fn evict_expired(&self, now: Instant) -> usize {
        let buckets: Vec<(usize, Arc<Bucket>)> = self
            .buckets
            .iter()
            .map(|bucket| (*bucket.key(), Arc::clone(bucket.value())))
            .collect();

        let mut evicted = 0;
        for (capacity, bucket) in buckets {
            loop {
                let expired = {
                    let mut entries = bucket.entries.lock();
                    match entries.back() {
                        Some(oldest) if oldest.expires_at <= now => entries.pop_back(),
                        _ => None,
                    }
                };
                let Some(entry) = expired else {
                    break;
                };
                self.allocator
                    .release(Buffer::from_storage(entry.storage, capacity));
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.counters.on_evict(evicted as u64);
            trace!(evicted, "evicted expired pooled buffers");
        }
        evicted
    }
}
