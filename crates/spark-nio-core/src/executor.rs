use crate::error::CoreError;

/// 可投递任务的执行器，由事件循环实现。
///
/// Handler 通过 [`Context::executor`](crate::Context::executor) 把跨线程动作排回连接所属的循环线程。
pub trait Executor: Send + Sync + 'static {
    /// 投递任务；执行器已关闭时返回 `InvalidState`。
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), CoreError>;

    /// 当前线程是否为该执行器的事件循环线程。
    fn in_event_loop(&self) -> bool;
}
