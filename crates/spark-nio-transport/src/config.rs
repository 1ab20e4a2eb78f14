use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use spark_nio_buffer::{PoolConfig, size_for};
use spark_nio_core::{CoreError, Handler};

use crate::error::{RESOLVE, invalid_config, map_io_error};
use crate::event_loop::EventLoop;

const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REBUILD_THRESHOLD: u32 = 512;
const DEFAULT_EVENTS_CAPACITY: usize = 1024;
/// 默认读缓冲容量。
pub const DEFAULT_READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// 事件循环参数。
///
/// # 教案式注释
///
/// ## 契约（What）
/// - `name`：循环线程名，同时出现在日志字段中；
/// - `select_timeout`：单次等待就绪的上限，保证循环定期醒来检测多路复用器是否失常；
/// - `rebuild_threshold`：连续“未超时却一无所获”的等待次数上限，超过即重建多路复用器；
/// - `events_capacity`：单次等待最多取回的就绪事件数；
/// - `pool`：注册到本循环的连接共用的缓冲池参数。
///
/// 反序列化时 `select_timeout_ms` 以毫秒表示，缺省字段取默认值。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EventLoopConfig {
    pub name: String,
    #[serde(rename = "select_timeout_ms", deserialize_with = "millis")]
    pub select_timeout: Duration,
    pub rebuild_threshold: u32,
    pub events_capacity: usize,
    pub pool: PoolConfig,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            name: "spark-nio-loop".to_owned(),
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            pool: PoolConfig::default(),
        }
    }
}

impl EventLoopConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    pub fn with_rebuild_threshold(mut self, threshold: u32) -> Self {
        self.rebuild_threshold = threshold;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(invalid_config("event loop name must not be empty"));
        }
        if self.select_timeout.is_zero() {
            return Err(invalid_config("select_timeout must be positive"));
        }
        if self.rebuild_threshold == 0 {
            return Err(invalid_config("rebuild_threshold must be positive"));
        }
        if self.events_capacity == 0 {
            return Err(invalid_config("events_capacity must be positive"));
        }
        self.pool
            .validate()
            .map_err(|error| invalid_config("invalid buffer pool configuration").with_cause(error))
    }
}

/// 连接参数中可序列化的部分，入站与出站路径通用。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub read_buffer_capacity: usize,
    pub auto_read: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
            auto_read: true,
        }
    }
}

impl ConnectionOptions {
    /// 读缓冲容量按 1 KiB 向上取整；非正值回落到默认容量。
    pub fn effective_read_capacity(&self) -> usize {
        if self.read_buffer_capacity == 0 {
            DEFAULT_READ_BUFFER_CAPACITY
        } else {
            size_for(self.read_buffer_capacity)
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.host.is_empty() {
            return Err(invalid_config("host must not be empty"));
        }
        Ok(())
    }

    /// 解析 `host:port`，取第一个地址。
    pub fn resolve(&self) -> Result<SocketAddr, CoreError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|error| map_io_error(RESOLVE, error))?
            .next()
            .ok_or_else(|| {
                map_io_error(
                    RESOLVE,
                    io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", self.host)),
                )
            })
    }
}

/// 一条连接（或一个监听器上全部连接）的完整配置。
///
/// `handler` 会被加入每条新流水线；同一实例在服务端被所有连接共享，
/// 需要逐连接状态的 Handler 应在 `handler_added` 中以新实例替换自身。
#[derive(Clone)]
pub struct ConnectionConfig {
    pub options: ConnectionOptions,
    pub handler: Arc<dyn Handler>,
    pub event_loop: Option<EventLoop>,
}

impl ConnectionConfig {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self::from_options(ConnectionOptions::default(), handler)
    }

    pub fn from_options(options: ConnectionOptions, handler: Arc<dyn Handler>) -> Self {
        Self {
            options,
            handler,
            event_loop: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.options.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    pub fn with_read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.options.read_buffer_capacity = capacity;
        self
    }

    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.options.auto_read = auto_read;
        self
    }

    /// 指定承载连接的事件循环；缺省使用共享默认循环。
    pub fn with_event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("options", &self.options)
            .field("handler", &self.handler.name())
            .field("event_loop", &self.event_loop)
            .finish()
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
