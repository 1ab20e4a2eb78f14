use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::PoolError;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MAX_PER_BUCKET: usize = 2048;
const DEFAULT_MIN_POOLED_CAPACITY: usize = 256;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// 缓冲池参数。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 高频消息场景下摊薄分配成本，同时在空闲期依靠 TTL 衰减回零额外内存；
/// - 将上限、下限与淘汰节奏显式化，避免无界持有。
///
/// ## 契约（What）
/// - `ttl`：入池条目的存活时长，超时后由淘汰扫描释放；
/// - `max_per_bucket`：单个容量桶的条目上限，超出即直接释放；
/// - `min_pooled_capacity`：低于此容量的缓冲不入池；
/// - `sweep_interval`：后台扫描周期；
/// - `spawn_sweeper`：是否启动后台扫描线程，关闭后需手动调用 `BufferPool::evict_expired`。
///
/// 反序列化时时长字段以毫秒表示（`ttl_ms`、`sweep_interval_ms`），缺省字段取默认值。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(rename = "ttl_ms", deserialize_with = "millis")]
    pub ttl: Duration,
    pub max_per_bucket: usize,
    pub min_pooled_capacity: usize,
    #[serde(rename = "sweep_interval_ms", deserialize_with = "millis")]
    pub sweep_interval: Duration,
    pub spawn_sweeper: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_per_bucket: DEFAULT_MAX_PER_BUCKET,
            min_pooled_capacity: DEFAULT_MIN_POOLED_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            spawn_sweeper: true,
        }
    }
}

impl PoolConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_per_bucket(mut self, max: usize) -> Self {
        self.max_per_bucket = max;
        self
    }

    pub fn with_min_pooled_capacity(mut self, min: usize) -> Self {
        self.min_pooled_capacity = min;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweeper(mut self, spawn: bool) -> Self {
        self.spawn_sweeper = spawn;
        self
    }

    /// 校验参数组合。
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.ttl.is_zero() {
            return Err(PoolError::InvalidConfig("ttl"));
        }
        if self.max_per_bucket == 0 {
            return Err(PoolError::InvalidConfig("max_per_bucket"));
        }
        if self.sweep_interval.is_zero() {
            return Err(PoolError::InvalidConfig("sweep_interval"));
        }
        Ok(())
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
