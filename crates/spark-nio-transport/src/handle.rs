use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use spark_nio_core::{Buffer, CoreError, Pipeline};
use tracing::debug;

use crate::connection::ConnectionEntry;
use crate::event_loop::EventLoop;

/// 连接的跨线程操作句柄。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 流水线回调只在事件循环线程上执行；应用线程通过本句柄把写入、关闭等操作
///   投递到循环线程，而不是直接触碰流水线。
///
/// ## 契约（What）
/// - 在循环线程内调用时直接执行，否则排入循环任务队列，按提交顺序执行；
/// - 投递后的执行错误转为流水线错误事件（头哨兵记录并关闭连接）；
/// - 流控开关（`set_auto_read`/`request_read`）为原子操作，可在任意线程直接调用。
#[derive(Clone)]
pub struct ConnectionHandle {
    entry: Arc<ConnectionEntry>,
}

impl ConnectionHandle {
    pub(crate) fn new(entry: Arc<ConnectionEntry>) -> Self {
        Self { entry }
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.entry.pipeline()
    }

    pub fn event_loop(&self) -> &EventLoop {
        self.entry.connection().event_loop()
    }

    /// 在循环线程上对流水线执行一段操作。
    pub fn execute(&self, action: impl FnOnce(&Pipeline) + Send + 'static) -> Result<(), CoreError> {
        if self.event_loop().in_event_loop() {
            action(self.pipeline());
            return Ok(());
        }
        let pipeline = self.pipeline().clone();
        self.event_loop().execute(move || action(&pipeline))
    }

    /// 自尾部写出一段字节。
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), CoreError> {
        let data = data.into();
        self.execute(move |pipeline| {
            if let Err(error) = pipeline.write(Buffer::read_only(data)) {
                pipeline.fire_error(error);
            }
        })
    }

    pub fn close(&self) -> Result<(), CoreError> {
        self.execute(|pipeline| {
            if let Err(error) = pipeline.close() {
                debug!(pipeline = pipeline.id(), %error, "close failed");
                pipeline.fire_error(error);
            }
        })
    }

    pub fn set_auto_read(&self, enabled: bool) {
        self.pipeline().flow().set_auto_read(enabled);
    }

    pub fn request_read(&self) {
        self.pipeline().flow().request_read();
    }

    pub fn is_closed(&self) -> bool {
        self.pipeline().is_closed()
    }

    pub fn is_open(&self) -> bool {
        self.pipeline().channel().is_open()
    }

    /// 尚未刷出到套接字的字节数。
    pub fn pending_bytes(&self) -> usize {
        self.entry.connection().pending_bytes()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.pipeline().channel().local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.pipeline().channel().peer_addr()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("pipeline", self.pipeline())
            .field("connection", self.entry.connection())
            .finish()
    }
}
