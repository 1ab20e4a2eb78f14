use std::net::SocketAddr;
use std::sync::mpsc;

use spark_nio_core::{Channel, CoreError, codes};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionEntry;
use crate::error::not_running;
use crate::event_loop::{EventLoop, LoopStatus};
use crate::handle::ConnectionHandle;
use crate::shared::resolve_event_loop;

/// 出站连接入口。
#[derive(Debug)]
pub struct TcpClient;

impl TcpClient {
    /// 解析地址、组装流水线并发起非阻塞连接。
    ///
    /// 返回时连接通常仍在建立中：完成后流水线收到 `connected`，
    /// 失败则以 `spark.nio.channel.connect_failed` 错误事件通知并关闭。
    /// 连接完成前的写入被排队，完成后先于 `connected` 刷出。
    ///
    /// 流水线组装与 `connect` 都在所属循环线程上执行，调用线程阻塞到它们完成；
    /// 已在该循环线程上时直接执行。
    pub fn connect(config: ConnectionConfig) -> Result<ConnectionHandle, CoreError> {
        config.options.validate()?;
        let event_loop = resolve_event_loop(config.event_loop.as_ref())?;
        let addr = config.options.resolve()?;
        if event_loop.in_event_loop() {
            return open(&event_loop, addr, config);
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        let task_loop = event_loop.clone();
        event_loop.execute(move || {
            let _ = sender.send(open(&task_loop, addr, config));
        })?;
        receiver.recv().map_err(|_| match event_loop.status() {
            LoopStatus::Running => CoreError::invalid_state(
                codes::HANDLER_PANICKED,
                "connection setup panicked on the event loop",
            ),
            status => not_running(status),
        })?
    }
}

fn open(
    event_loop: &EventLoop,
    addr: SocketAddr,
    config: ConnectionConfig,
) -> Result<ConnectionHandle, CoreError> {
    let entry = ConnectionEntry::establish(
        event_loop,
        None,
        config.options.effective_read_capacity(),
        config.options.auto_read,
        config.handler,
    )?;
    let started = entry
        .pipeline()
        .connect(addr)
        .and_then(|()| event_loop.register(entry.clone()).map(drop));
    if let Err(error) = started {
        if let Err(close_error) = entry.connection().close() {
            debug!(pipeline = entry.pipeline().id(), %close_error, "channel close failed");
        }
        return Err(error);
    }
    debug!(%addr, pipeline = entry.pipeline().id(), "tcp client connecting");
    Ok(ConnectionHandle::new(entry))
}
