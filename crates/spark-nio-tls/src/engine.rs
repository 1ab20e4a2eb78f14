use std::fmt;

use spark_nio_buffer::Buffer;
use spark_nio_core::CoreError;

/// 引擎扮演的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// 握手进度。
///
/// `Finished` 只出现在操作结果中，并且只出现一次：它标记握手恰好在该次操作中完成。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    Finished,
}

/// 单次 `wrap`/`unwrap` 的记录层结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// 输入不足一个完整记录，需要更多网络字节。
    BufferUnderflow,
    /// 目标缓冲放不下输出，调用方应扩大后重试。
    BufferOverflow,
    /// 该方向已关闭。
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    /// 既未消费也未产出：被网络阻塞，继续循环没有意义。
    pub fn is_stalled(&self) -> bool {
        self.bytes_consumed == 0 && self.bytes_produced == 0
    }
}

/// 需要在循环线程上同步执行的委托任务（例如证书校验等 CPU 密集步骤）。
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// 外部 TLS 引擎能力：记录层加解密与握手状态迁移。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 适配器只依赖这组能力驱动握手与记录分帧，密码学实现、证书信任与线上记录格式都封装在引擎内；
///
/// ## 契约（What）
/// - `wrap(src, dst)`：把 `src` 中的应用字节加密写入 `dst` 的剩余容量；握手期间不消费应用字节，
///   只产出握手记录；
/// - `unwrap(src, dst)`：解密 `src` 中的网络字节，把明文写入 `dst`；`src` 中不完整的记录不会被消费；
/// - 两者都通过 `bytes_consumed`/`bytes_produced` 报告进度，`handshake_status` 报告操作后的握手状态；
/// - `application_buffer_size`/`packet_buffer_size` 为会话建议的明文/密文缓冲尺寸；
/// - 握手状态为 `NeedTask` 时，调用方反复取出 `delegated_task` 并同步执行，直到返回 `None`。
pub trait TlsEngine: Send + 'static {
    fn role(&self) -> Role;

    fn begin_handshake(&mut self) -> Result<(), CoreError>;

    fn handshake_status(&self) -> HandshakeStatus;

    fn wrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, CoreError>;

    fn unwrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, CoreError>;

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn application_buffer_size(&self) -> usize;

    fn packet_buffer_size(&self) -> usize;

    /// 准备发送 close_notify；此后 `wrap` 只产出告警记录并报告 `Closed`。
    fn close_outbound(&mut self);

    /// 网络读方向结束。
    fn close_inbound(&mut self) {}
}

impl fmt::Debug for dyn TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngine")
            .field("role", &self.role())
            .field("handshake_status", &self.handshake_status())
            .finish()
    }
}
