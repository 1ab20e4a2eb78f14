use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use spark_nio_buffer::Buffer;
use tracing::warn;

use crate::error::CoreError;
use crate::executor::Executor;
use crate::flow::FlowControl;
use crate::handler::{Handler, Interests};

use super::arena::{Direction, Lease, Position};
use super::{NodeId, Pipeline};

/// 传给 Handler 回调的节点视图。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 回调通过它把事件交给同方向的下一个节点，或者在自身位置修改链路；
/// - 事件总是从“当前节点”出发寻找下一个关心该事件的节点，跳过未声明兴趣的节点。
///
/// ## 契约（What）
/// - `fire_receive`/`fire_connected`/`fire_read_terminated` 向尾部转发；
/// - `write`/`connect`/`close`/`fire_error` 向头部转发；
/// - 节点被移除后，正在执行的回调仍可通过本上下文把事件送入剩余链路，
///   但链路变更操作会返回 `InvalidState`；
/// - 找不到下一个节点时（仅在链路被整体拆除后可能发生），缓冲被归还给池。
#[derive(Clone)]
pub struct Context {
    pipeline: Pipeline,
    lease: Lease,
}

impl Context {
    pub(crate) fn new(pipeline: Pipeline, lease: Lease) -> Self {
        Self { pipeline, lease }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn node(&self) -> NodeId {
        self.lease.node
    }

    /// 当前节点是否已被移除或替换。
    pub fn is_removed(&self) -> bool {
        !self.pipeline.is_linked(self.lease.node)
    }

    pub fn fire_receive(&self, buffer: Buffer) -> Result<(), CoreError> {
        match self.next(Direction::Inbound, Interests::RECEIVE) {
            Some((ctx, handler)) => handler.on_receive(&ctx, buffer),
            None => {
                self.pipeline.free(buffer);
                Ok(())
            }
        }
    }

    pub fn fire_connected(&self) -> Result<(), CoreError> {
        match self.next(Direction::Inbound, Interests::CONNECTED) {
            Some((ctx, handler)) => handler.on_connected(&ctx),
            None => Ok(()),
        }
    }

    pub fn fire_read_terminated(&self) -> Result<(), CoreError> {
        match self.next(Direction::Inbound, Interests::READ_TERMINATED) {
            Some((ctx, handler)) => handler.on_read_terminated(&ctx),
            None => Ok(()),
        }
    }

    pub fn write(&self, buffer: Buffer) -> Result<(), CoreError> {
        match self.next(Direction::Outbound, Interests::WRITE) {
            Some((ctx, handler)) => handler.on_write(&ctx, buffer),
            None => {
                self.pipeline.free(buffer);
                Ok(())
            }
        }
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<(), CoreError> {
        match self.next(Direction::Outbound, Interests::CONNECT) {
            Some((ctx, handler)) => handler.on_connect(&ctx, addr),
            None => Ok(()),
        }
    }

    pub fn close(&self) -> Result<(), CoreError> {
        match self.next(Direction::Outbound, Interests::CLOSE) {
            Some((ctx, handler)) => handler.on_close(&ctx),
            None => Ok(()),
        }
    }

    pub fn fire_error(&self, error: CoreError) {
        match self.next(Direction::Outbound, Interests::ERROR) {
            Some((ctx, handler)) => handler.on_error(&ctx, error),
            None => warn!(
                pipeline = self.pipeline.id(),
                code = error.code(),
                %error,
                "error reached no handler"
            ),
        }
    }

    /// 在当前节点之前（靠近头部）插入。
    pub fn add_before(&self, handler: Arc<dyn Handler>) -> Result<NodeId, CoreError> {
        self.pipeline
            .insert(self.lease.node, Position::Before, handler)
    }

    /// 在当前节点之后（靠近尾部）插入。
    pub fn add_after(&self, handler: Arc<dyn Handler>) -> Result<NodeId, CoreError> {
        self.pipeline
            .insert(self.lease.node, Position::After, handler)
    }

    /// 以新 Handler 原位替换当前节点。
    pub fn replace(&self, handler: Arc<dyn Handler>) -> Result<NodeId, CoreError> {
        self.pipeline.replace(self.lease.node, handler)
    }

    /// 从链路中移除当前节点。
    pub fn remove(&self) -> Result<(), CoreError> {
        self.pipeline.remove(self.lease.node)
    }

    pub fn allocate(&self, capacity: usize) -> Buffer {
        self.pipeline.allocate(capacity)
    }

    pub fn free(&self, buffer: impl Into<Option<Buffer>>) {
        self.pipeline.free(buffer);
    }

    pub fn flow(&self) -> &FlowControl {
        self.pipeline.flow()
    }

    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.pipeline.executor()
    }

    fn next(&self, direction: Direction, event: Interests) -> Option<(Context, Arc<dyn Handler>)> {
        self.pipeline.next_handler(&self.lease, direction, event)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("pipeline", &self.pipeline.id())
            .field("node", &self.lease.node.serial())
            .finish()
    }
}
