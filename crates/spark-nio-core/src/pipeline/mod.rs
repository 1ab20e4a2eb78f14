//! 每连接一条的可变 Handler 流水线。
//!
//! # 模块定位（Why）
//! - 连接适配器把通道就绪事件翻译为流水线事件，应用协议逻辑以 Handler 形式挂在链上；
//! - Handler 可以在自身回调中插入、替换或移除节点，变更只影响之后的分派。
//!
//! # 结构（How）
//! - `arena`：以下标表达前后关系的节点表；
//! - `context`：传给回调的节点视图，提供事件转发与链路变更操作；
//! - `sentinel`：头尾哨兵的默认行为。

mod arena;
mod context;
mod sentinel;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use spark_nio_buffer::{Buffer, BufferPool};
use tracing::trace;

use crate::channel::Channel;
use crate::error::{CoreError, codes};
use crate::executor::Executor;
use crate::flow::FlowControl;
use crate::handler::{Handler, Interests};

use arena::{Arena, Direction, HEAD, Lease, Position, TAIL};
pub use context::Context;
use sentinel::{Head, Tail};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// 流水线中节点的标识：槽位下标 + 全局单调序号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    serial: u64,
}

impl NodeId {
    /// 全局单调递增的节点序号。
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// 连接的 Handler 流水线句柄。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 一个连接拥有一条流水线；流水线拥有节点序列、通道视图、缓冲池句柄与流控状态；
/// - 句柄可廉价克隆，Handler 通过 [`Context::pipeline`] 获取它以便跨节点触发事件。
///
/// ## 逻辑（How）
/// - 节点表由 `parking_lot::Mutex` 保护，锁只在查找邻居与修改链接时持有，
///   分派时先克隆目标 Handler 的 `Arc` 再释放锁调用，因此回调内部可以重入；
/// - `closed` 标志保证 [`close`](Self::close) 只向链路发出一次关闭；
/// - 执行器（所属事件循环）在注册时绑定一次。
///
/// ## 契约（What）
/// - 入站入口（`fire_*`）从头哨兵之后开始；出站入口（`write`/`connect`/`close`）
///   与 `fire_error` 从尾哨兵之前开始；
/// - 流水线本身不捕获回调返回的错误，调用者（连接适配器）负责把它们转为 `fire_error`；
/// - Handler 若长期持有 [`Context`] 会形成引用环，需要时应改持 [`WeakPipeline`]。
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

/// 不延长流水线生命周期的弱句柄。
#[derive(Clone)]
pub struct WeakPipeline {
    inner: Weak<PipelineInner>,
}

struct PipelineInner {
    id: u64,
    arena: Mutex<Arena>,
    channel: Arc<dyn Channel>,
    pool: BufferPool,
    flow: FlowControl,
    closed: AtomicBool,
    executor: OnceLock<Arc<dyn Executor>>,
}

impl Pipeline {
    /// 创建只含头尾哨兵的流水线，初始开启自动读。
    pub fn new(channel: Arc<dyn Channel>, pool: BufferPool) -> Self {
        Self::with_auto_read(channel, pool, true)
    }

    pub fn with_auto_read(channel: Arc<dyn Channel>, pool: BufferPool, auto_read: bool) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
                arena: Mutex::new(Arena::new(Arc::new(Head), Arc::new(Tail))),
                channel,
                pool,
                flow: FlowControl::new(auto_read),
                closed: AtomicBool::new(false),
                executor: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 在尾哨兵之前追加 Handler。
    pub fn add_last(&self, handler: Arc<dyn Handler>) -> Result<NodeId, CoreError> {
        let tail = self.inner.arena.lock().node(TAIL);
        self.insert(tail, Position::Before, handler)
    }

    /// 在头哨兵之后插入 Handler。
    pub fn add_first(&self, handler: Arc<dyn Handler>) -> Result<NodeId, CoreError> {
        let head = self.inner.arena.lock().node(HEAD);
        self.insert(head, Position::After, handler)
    }

    /// 入站数据，自头部起分派。
    pub fn fire_receive(&self, buffer: Buffer) -> Result<(), CoreError> {
        self.context(HEAD).fire_receive(buffer)
    }

    pub fn fire_connected(&self) -> Result<(), CoreError> {
        self.context(HEAD).fire_connected()
    }

    pub fn fire_read_terminated(&self) -> Result<(), CoreError> {
        self.context(HEAD).fire_read_terminated()
    }

    /// 出站写，自尾部起分派。
    pub fn write(&self, buffer: Buffer) -> Result<(), CoreError> {
        self.context(TAIL).write(buffer)
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<(), CoreError> {
        self.context(TAIL).connect(addr)
    }

    /// 关闭流水线：只有第一次调用会沿链路发出关闭。
    pub fn close(&self) -> Result<(), CoreError> {
        if self.mark_closed() {
            return Ok(());
        }
        trace!(pipeline = self.id(), "closing pipeline");
        self.context(TAIL).close()
    }

    /// 错误事件，自尾部起朝头部传播。
    pub fn fire_error(&self, error: CoreError) {
        self.context(TAIL).fire_error(error);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn allocate(&self, capacity: usize) -> Buffer {
        self.inner.pool.allocate(capacity)
    }

    pub fn free(&self, buffer: impl Into<Option<Buffer>>) {
        self.inner.pool.free(buffer);
    }

    pub fn flow(&self) -> &FlowControl {
        &self.inner.flow
    }

    /// 所属事件循环；注册前为 `None`。
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.inner.executor.get().cloned()
    }

    /// 绑定所属执行器，只能绑定一次。
    pub fn attach_executor(&self, executor: Arc<dyn Executor>) -> Result<(), CoreError> {
        self.inner.executor.set(executor).map_err(|_| {
            CoreError::invalid_state(
                codes::PIPELINE_EXECUTOR_BOUND,
                "pipeline is already bound to an event loop",
            )
        })
    }

    /// 按链路顺序列出用户 Handler 的名称。
    pub fn names(&self) -> Vec<&'static str> {
        let nodes = self.inner.arena.lock().user_nodes();
        nodes.iter().map(|(_, handler)| handler.name()).collect()
    }

    /// 用户节点数量。
    pub fn len(&self) -> usize {
        self.inner.arena.lock().user_nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取得首个名称匹配的用户节点上下文。
    pub fn context_of(&self, name: &str) -> Option<Context> {
        let nodes = self.inner.arena.lock().user_nodes();
        nodes
            .into_iter()
            .find(|(_, handler)| handler.name() == name)
            .map(|(lease, _)| Context::new(self.clone(), lease))
    }

    pub fn downgrade(&self) -> WeakPipeline {
        WeakPipeline {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 置位关闭标志，返回之前是否已关闭。
    pub(crate) fn mark_closed(&self) -> bool {
        self.inner.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn context(&self, index: usize) -> Context {
        let lease = self.inner.arena.lock().lease(index);
        Context::new(self.clone(), lease)
    }

    pub(crate) fn is_linked(&self, node: NodeId) -> bool {
        self.inner.arena.lock().is_linked(node)
    }

    pub(crate) fn next_handler(
        &self,
        from: &Lease,
        direction: Direction,
        event: Interests,
    ) -> Option<(Context, Arc<dyn Handler>)> {
        let found = self.inner.arena.lock().find(from, direction, event);
        found.map(|(lease, handler)| (Context::new(self.clone(), lease), handler))
    }

    pub(crate) fn insert(
        &self,
        anchor: NodeId,
        position: Position,
        handler: Arc<dyn Handler>,
    ) -> Result<NodeId, CoreError> {
        let interests = handler.interests();
        let lease = self.inner.arena.lock().insert(
            anchor,
            position,
            Arc::clone(&handler),
            interests,
        )?;
        let node = lease.node;
        trace!(
            pipeline = self.id(),
            node = node.serial,
            handler = handler.name(),
            "handler added"
        );
        handler.handler_added(&Context::new(self.clone(), lease))?;
        Ok(node)
    }

    pub(crate) fn remove(&self, node: NodeId) -> Result<(), CoreError> {
        let removed = self.inner.arena.lock().remove(node)?;
        trace!(pipeline = self.id(), node = node.serial, "handler removed");
        drop(removed);
        Ok(())
    }

    pub(crate) fn replace(
        &self,
        node: NodeId,
        handler: Arc<dyn Handler>,
    ) -> Result<NodeId, CoreError> {
        let interests = handler.interests();
        let (replacement, old) =
            self.inner
                .arena
                .lock()
                .replace(node, Arc::clone(&handler), interests)?;
        let added = replacement.node;
        trace!(
            pipeline = self.id(),
            old = node.serial,
            new = added.serial,
            handler = handler.name(),
            "handler replaced"
        );
        drop(old);
        handler.handler_added(&Context::new(self.clone(), replacement))?;
        Ok(added)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id())
            .field("handlers", &self.names())
            .field("closed", &self.is_closed())
            .field("flow", &self.inner.flow)
            .finish()
    }
}

impl WeakPipeline {
    pub fn upgrade(&self) -> Option<Pipeline> {
        self.inner.upgrade().map(|inner| Pipeline { inner })
    }
}

impl fmt::Debug for WeakPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakPipeline")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
