use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;

use spark_nio_buffer::Buffer;

use crate::error::CoreError;
use crate::pipeline::Context;

/// Handler 关心的事件集合，节点构造时读取一次并缓存。
///
/// 分派时会跳过掩码中不含当前事件的节点，长串直通节点因此不增加逐事件成本。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interests(u8);

impl Interests {
    pub const NONE: Self = Self(0);
    pub const RECEIVE: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);
    pub const CONNECTED: Self = Self(1 << 2);
    pub const CONNECT: Self = Self(1 << 3);
    pub const CLOSE: Self = Self(1 << 4);
    pub const READ_TERMINATED: Self = Self(1 << 5);
    pub const ERROR: Self = Self(1 << 6);
    pub const ALL: Self = Self(0x7f);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interests {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for Interests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Interests, &str); 7] = [
            (Interests::RECEIVE, "RECEIVE"),
            (Interests::WRITE, "WRITE"),
            (Interests::CONNECTED, "CONNECTED"),
            (Interests::CONNECT, "CONNECT"),
            (Interests::CLOSE, "CLOSE"),
            (Interests::READ_TERMINATED, "READ_TERMINATED"),
            (Interests::ERROR, "ERROR"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// 连接生命周期回调的集合，每个回调都有“原样转发”的默认实现。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 应用协议逻辑（代理、中继、心跳）唯一的接入面：只覆写 `on_receive`/`on_connected`
///   的实现，其余事件自动获得正确的直通行为；
/// - 回调以 `&self` 接收，Handler 以 `Arc` 共享存放在流水线节点中，
///   分派时先克隆再调用，因此回调内部可以自由地再次触发事件或修改流水线。
///
/// ## 方向（How）
/// - 入站（头 → 尾）：`on_receive`、`on_connected`、`on_read_terminated`；
/// - 出站（尾 → 头）：`on_write`、`on_connect`、`on_close`；
/// - 错误朝头部传播，头哨兵是最终归宿：记录日志并关闭通道。
///
/// ## 契约（What）
/// - 同一连接的回调只在其事件循环线程上串行执行，Handler 不需要为流水线内状态加锁；
/// - 返回 `Err` 的回调由连接适配器在分派边界统一转为 `on_error`，流水线自身不捕获；
/// - `on_error` 可以拦截错误并改为普通关闭，也可以调用 `ctx.fire_error` 继续传播；
/// - `interests` 只在节点构造时读取一次，返回值应与实际覆写的回调一致。
pub trait Handler: Send + Sync + 'static {
    /// 用于日志与调试的名称。
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// 声明关心的事件，默认全部。
    fn interests(&self) -> Interests {
        Interests::ALL
    }

    /// 节点加入流水线后立即调用，可在此替换自身（例如安装 TLS 适配器）。
    fn handler_added(&self, ctx: &Context) -> Result<(), CoreError> {
        let _ = ctx;
        Ok(())
    }

    /// 收到入站数据。
    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        ctx.fire_receive(buffer)
    }

    /// 出站写。
    fn on_write(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        ctx.write(buffer)
    }

    /// 通道已连接（或 TLS 握手完成）。
    fn on_connected(&self, ctx: &Context) -> Result<(), CoreError> {
        ctx.fire_connected()
    }

    /// 发起连接。
    fn on_connect(&self, ctx: &Context, addr: SocketAddr) -> Result<(), CoreError> {
        ctx.connect(addr)
    }

    /// 发起关闭。
    fn on_close(&self, ctx: &Context) -> Result<(), CoreError> {
        ctx.close()
    }

    /// 对端半关闭，读方向终止。
    fn on_read_terminated(&self, ctx: &Context) -> Result<(), CoreError> {
        ctx.fire_read_terminated()
    }

    /// 错误事件。
    fn on_error(&self, ctx: &Context, error: CoreError) {
        ctx.fire_error(error);
    }
}
