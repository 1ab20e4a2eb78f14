#![doc = r#"
# spark-nio-core

## 定位（Why）
- 定义每连接一条的 Handler 流水线：应用协议逻辑唯一的接入面；
- 统一错误分层（I/O、协议、资源、TLS、状态误用），让任意节点都能拦截或降级错误；
- 声明事件循环与通道在流水线眼中的最小能力（[`Channel`]、[`Executor`]），
  使本 crate 不依赖任何具体的多路复用实现。

## 结构（How）
- [`Handler`]：带直通默认实现的回调集合，[`Interests`] 掩码让分派跳过不关心的节点；
- [`Pipeline`] / [`Context`]：下标链表上的双向分派与运行期链路变更；
- [`FlowControl`]：自动读与一次性读请求，供连接适配器决定是否挂载读兴趣；
- [`handlers`]：I/O 错误降级与事件日志两个通用 Handler。

## 契约（What）
- 同一连接的全部回调在其事件循环线程上串行执行；
- 回调返回的错误由调用方（连接适配器）在分派边界转为 `on_error`，流水线自身不吞错。
"#]

mod channel;
mod error;
mod executor;
mod flow;
mod handler;
pub mod handlers;
mod pipeline;

pub use channel::Channel;
pub use error::{CoreError, ErrorKind, codes};
pub use executor::Executor;
pub use flow::FlowControl;
pub use handler::{Handler, Interests};
pub use pipeline::{Context, NodeId, Pipeline, WeakPipeline};
pub use spark_nio_buffer::{Buffer, BufferPool};
