use std::net::SocketAddr;

use spark_nio_buffer::Buffer;
use tracing::{debug, info, trace, warn};

use crate::error::CoreError;
use crate::handler::Handler;

use super::Context;

/// 头哨兵：出站事件的终点，也是错误的默认归宿。
///
/// - 写：调用通道写出，无论成败都把缓冲归还给池；
/// - 关闭：置位流水线关闭标志并关闭通道，关闭失败只记录日志；
/// - 错误：I/O 类按 `info` 记录，其余按 `warn` 记录，随后无条件关闭通道。
pub(crate) struct Head;

impl Handler for Head {
    fn name(&self) -> &'static str {
        "head"
    }

    fn on_write(&self, ctx: &Context, mut buffer: Buffer) -> Result<(), CoreError> {
        let result = ctx.pipeline().channel().write(&mut buffer);
        ctx.free(buffer);
        result
    }

    fn on_connect(&self, ctx: &Context, addr: SocketAddr) -> Result<(), CoreError> {
        ctx.pipeline().channel().connect(addr)
    }

    fn on_close(&self, ctx: &Context) -> Result<(), CoreError> {
        close_channel(ctx);
        Ok(())
    }

    fn on_error(&self, ctx: &Context, error: CoreError) {
        let pipeline = ctx.pipeline().id();
        if error.is_io() {
            info!(pipeline, code = error.code(), %error, "connection i/o failure, closing");
        } else {
            warn!(pipeline, code = error.code(), %error, "unhandled pipeline error, closing");
        }
        close_channel(ctx);
    }
}

fn close_channel(ctx: &Context) {
    let pipeline = ctx.pipeline();
    pipeline.mark_closed();
    if let Err(error) = pipeline.channel().close() {
        warn!(pipeline = pipeline.id(), %error, "failed to close channel");
    }
}

/// 尾哨兵：入站事件的终点。
///
/// - 收到仍有未读字节的缓冲时记录一次调试日志，然后归还；
/// - 读方向终止时关闭整条流水线（`Pipeline::close` 保证只发生一次）。
pub(crate) struct Tail;

impl Handler for Tail {
    fn name(&self) -> &'static str {
        "tail"
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        if !buffer.is_empty() {
            debug!(
                pipeline = ctx.pipeline().id(),
                remaining = buffer.remaining(),
                "unconsumed inbound buffer reached tail"
            );
        }
        ctx.free(buffer);
        Ok(())
    }

    fn on_connected(&self, ctx: &Context) -> Result<(), CoreError> {
        trace!(pipeline = ctx.pipeline().id(), "connected reached tail");
        Ok(())
    }

    fn on_read_terminated(&self, ctx: &Context) -> Result<(), CoreError> {
        ctx.pipeline().close()
    }
}
