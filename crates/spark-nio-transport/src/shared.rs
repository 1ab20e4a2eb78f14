use parking_lot::Mutex;
use spark_nio_core::CoreError;
use tracing::info;

use crate::config::EventLoopConfig;
use crate::event_loop::{EventLoop, LoopStatus};

static DEFAULT_LOOP: Mutex<Option<EventLoop>> = parking_lot::const_mutex(None);

/// 进程级共享事件循环，首次调用时创建并启动；拒绝 `close`。
pub fn default_event_loop() -> Result<EventLoop, CoreError> {
    let mut slot = DEFAULT_LOOP.lock();
    if let Some(event_loop) = slot.as_ref() {
        return Ok(event_loop.clone());
    }
    let event_loop = EventLoop::shared(EventLoopConfig::default().with_name("spark-nio-default"))?;
    event_loop.start()?;
    info!(event_loop = %event_loop.name(), "shared event loop created");
    *slot = Some(event_loop.clone());
    Ok(event_loop)
}

/// 取得配置指定的循环（缺省为共享循环），尚未启动时启动它。
pub(crate) fn resolve_event_loop(configured: Option<&EventLoop>) -> Result<EventLoop, CoreError> {
    let event_loop = match configured {
        Some(event_loop) => event_loop.clone(),
        None => return default_event_loop(),
    };
    if event_loop.status() == LoopStatus::Ready
        && let Err(error) = event_loop.start()
        && event_loop.status() != LoopStatus::Running
    {
        return Err(error);
    }
    Ok(event_loop)
}
