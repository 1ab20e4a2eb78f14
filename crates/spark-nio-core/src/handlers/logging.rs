use std::net::SocketAddr;

use spark_nio_buffer::Buffer;
use tracing::Level;

use crate::error::CoreError;
use crate::handler::Handler;
use crate::pipeline::Context;

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            _ => tracing::trace!($($arg)+),
        }
    };
}

/// 以固定级别记录经过的每个事件并原样转发。
///
/// 插在链路任意位置即可观察该位置两侧的流量，常用于排查 TLS 前后的明文与密文边界。
#[derive(Clone, Copy, Debug)]
pub struct LoggingHandler {
    level: Level,
    label: &'static str,
}

impl LoggingHandler {
    pub fn new(label: &'static str, level: Level) -> Self {
        Self { level, label }
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new("pipeline", Level::DEBUG)
    }
}

impl Handler for LoggingHandler {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        log_at!(
            self.level,
            label = self.label,
            pipeline = ctx.pipeline().id(),
            bytes = buffer.remaining(),
            eos = buffer.is_end_of_stream(),
            "receive"
        );
        ctx.fire_receive(buffer)
    }

    fn on_write(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        log_at!(
            self.level,
            label = self.label,
            pipeline = ctx.pipeline().id(),
            bytes = buffer.remaining(),
            "write"
        );
        ctx.write(buffer)
    }

    fn on_connected(&self, ctx: &Context) -> Result<(), CoreError> {
        log_at!(self.level, label = self.label, pipeline = ctx.pipeline().id(), "connected");
        ctx.fire_connected()
    }

    fn on_connect(&self, ctx: &Context, addr: SocketAddr) -> Result<(), CoreError> {
        log_at!(
            self.level,
            label = self.label,
            pipeline = ctx.pipeline().id(),
            %addr,
            "connect"
        );
        ctx.connect(addr)
    }

    fn on_close(&self, ctx: &Context) -> Result<(), CoreError> {
        log_at!(self.level, label = self.label, pipeline = ctx.pipeline().id(), "close");
        ctx.close()
    }

    fn on_read_terminated(&self, ctx: &Context) -> Result<(), CoreError> {
        log_at!(
            self.level,
            label = self.label,
            pipeline = ctx.pipeline().id(),
            "read terminated"
        );
        ctx.fire_read_terminated()
    }

    fn on_error(&self, ctx: &Context, error: CoreError) {
        log_at!(
            self.level,
            label = self.label,
            pipeline = ctx.pipeline().id(),
            code = error.code(),
            %error,
            "error"
        );
        ctx.fire_error(error);
    }
}
