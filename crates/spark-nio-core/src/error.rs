use std::borrow::Cow;
use std::error::Error;
use std::io;

use thiserror::Error;

/// 错误的处置分类，对应流水线层面的四类故障外加状态误用。
///
/// # 契约说明（What）
/// - `Io`：连接复位、管道破裂等传输层故障，默认动作是关闭通道；
/// - `Protocol`：Handler 自行判定的协议错误（握手格式错误、缓冲头部超长等）；
/// - `Resource`：资源类故障（分配失败、回调 panic 等）；
/// - `Tls`：TLS 解码失败或意外的 CLOSED 状态；
/// - `InvalidState`：在错误的生命周期阶段调用 API，例如向未运行的事件循环注册。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Io,
    Protocol,
    Resource,
    Tls,
    InvalidState,
}

/// 运行时统一错误类型：稳定错误码 + 人类可读消息 + 可选底层原因。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - Handler 回调、事件循环与 TLS 适配器共享同一错误类型，
///   使任意节点都能按 [`ErrorKind`] 决定“拦截并降级为关闭”还是继续向头部传播；
/// - `code` 为 `'static` 字符串，便于日志聚合与测试断言。
///
/// ## 契约（What）
/// - `code` 遵循 `spark.nio.<域>.<语义>` 命名，常用码值见 [`codes`]；
/// - `source()` 暴露底层原因（例如 `std::io::Error`、`rustls::Error`）。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct CoreError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 以 `operation` 描述包装 I/O 错误，保留原始错误作为原因。
    pub fn io(code: &'static str, operation: &str, error: io::Error) -> Self {
        Self::new(ErrorKind::Io, code, format!("{operation}: {error}")).with_cause(error)
    }

    pub fn protocol(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Protocol, code, message)
    }

    pub fn invalid_state(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidState, code, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 是否为传输层 I/O 故障。
    pub fn is_io(&self) -> bool {
        self.kind == ErrorKind::Io
    }
}

impl From<io::Error> for CoreError {
    fn from(error: io::Error) -> Self {
        Self::io(codes::IO, "io", error)
    }
}

/// 稳定错误码。
pub mod codes {
    /// 未细分的 I/O 错误。
    pub const IO: &str = "spark.nio.io";
    /// 通道读取失败。
    pub const CHANNEL_READ: &str = "spark.nio.channel.read_failed";
    /// 通道写入失败。
    pub const CHANNEL_WRITE: &str = "spark.nio.channel.write_failed";
    /// 通道连接失败。
    pub const CHANNEL_CONNECT: &str = "spark.nio.channel.connect_failed";
    /// 通道已关闭。
    pub const CHANNEL_CLOSED: &str = "spark.nio.channel.closed";
    /// 哨兵节点不可移除、替换，也不可在其外侧插入。
    pub const PIPELINE_SENTINEL: &str = "spark.nio.pipeline.sentinel_immutable";
    /// 节点已从流水线移除。
    pub const PIPELINE_NODE_REMOVED: &str = "spark.nio.pipeline.node_removed";
    /// 流水线已绑定执行器。
    pub const PIPELINE_EXECUTOR_BOUND: &str = "spark.nio.pipeline.executor_bound";
    /// Handler 回调 panic。
    pub const HANDLER_PANICKED: &str = "spark.nio.handler.panicked";
    /// 事件循环未处于运行态。
    pub const EVENT_LOOP_NOT_RUNNING: &str = "spark.nio.event_loop.not_running";
    /// 共享事件循环不可关闭。
    pub const EVENT_LOOP_SHARED: &str = "spark.nio.event_loop.shared_close";
    /// 事件循环线程创建或多路复用器初始化失败。
    pub const EVENT_LOOP_START: &str = "spark.nio.event_loop.start_failed";
    /// 注册到多路复用器失败。
    pub const EVENT_LOOP_REGISTER: &str = "spark.nio.event_loop.register_failed";
    /// 配置项非法。
    pub const CONFIG_INVALID: &str = "spark.nio.config.invalid";
}
