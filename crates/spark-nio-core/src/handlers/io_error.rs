use tracing::debug;

use crate::error::CoreError;
use crate::handler::{Handler, Interests};
use crate::pipeline::Context;

/// 把 I/O 类错误降级为普通关闭，其余错误继续向头部传播。
///
/// 对端复位、管道破裂在代理场景下司空见惯，没必要以告警级别穿过整条链路；
/// 放在链路靠尾位置即可覆盖所有节点抛出的错误。
#[derive(Clone, Copy, Debug, Default)]
pub struct IoErrorHandler;

impl Handler for IoErrorHandler {
    fn name(&self) -> &'static str {
        "io-error"
    }

    fn interests(&self) -> Interests {
        Interests::ERROR
    }

    fn on_error(&self, ctx: &Context, error: CoreError) {
        if !error.is_io() {
            ctx.fire_error(error);
            return;
        }
        debug!(pipeline = ctx.pipeline().id(), %error, "i/o error demoted to close");
        if let Err(close_error) = ctx.close() {
            ctx.fire_error(close_error);
        }
    }
}
