//! 传输层集成测试共用的 Handler、事件循环构造与等待工具。
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spark_nio_buffer::PoolConfig;
use spark_nio_core::{Buffer, Context, CoreError, Handler, Pipeline};
use spark_nio_transport::{ConnectionConfig, EventLoop, EventLoopConfig};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 已启动的独立事件循环，缓冲池不启动清扫线程。
pub fn started_loop(name: &str) -> EventLoop {
    init_tracing();
    let config = EventLoopConfig::default()
        .with_name(name)
        .with_select_timeout(Duration::from_millis(200))
        .with_pool(PoolConfig::default().with_sweeper(false));
    let event_loop = EventLoop::new(config).expect("创建事件循环失败");
    event_loop.start().expect("启动事件循环失败");
    event_loop
}

pub fn shutdown(event_loop: &EventLoop) {
    event_loop.close().expect("关闭事件循环失败");
    event_loop.join().expect("等待事件循环退出失败");
}

/// 监听回环地址任意端口的配置。
pub fn loopback(handler: Arc<dyn Handler>, event_loop: &EventLoop) -> ConnectionConfig {
    ConnectionConfig::new(handler)
        .with_host("127.0.0.1")
        .with_port(0)
        .with_event_loop(event_loop.clone())
}

/// 轮询直到条件成立；超时则失败。
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "等待超时：{what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// 记录一条连接上发生的全部入站事件。
#[derive(Default)]
pub struct Recorder {
    received: Mutex<Vec<u8>>,
    connected: AtomicUsize,
    end_of_stream: AtomicUsize,
    closes: AtomicUsize,
    errors: Mutex<Vec<&'static str>>,
    data_before_connected: AtomicBool,
    pipeline: Mutex<Option<Pipeline>>,
    echo: bool,
    greeting: Option<&'static [u8]>,
    close_after_greeting: bool,
    panic_on_receive: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }

    /// 连接后写出问候语并立即关闭。
    pub fn greet_and_close(text: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            greeting: Some(text),
            close_after_greeting: true,
            ..Self::default()
        })
    }

    pub fn panicking() -> Arc<Self> {
        Arc::new(Self {
            panic_on_receive: true,
            ..Self::default()
        })
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn end_of_stream(&self) -> usize {
        self.end_of_stream.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<&'static str> {
        self.errors.lock().clone()
    }

    pub fn data_before_connected(&self) -> bool {
        self.data_before_connected.load(Ordering::SeqCst)
    }

    /// 连接建立时记录下的流水线。
    pub fn pipeline(&self) -> Option<Pipeline> {
        self.pipeline.lock().clone()
    }
}

impl Handler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        if buffer.is_end_of_stream() {
            self.end_of_stream.fetch_add(1, Ordering::SeqCst);
            return ctx.fire_receive(buffer);
        }
        if self.panic_on_receive {
            panic!("recorder asked to panic");
        }
        if self.connected() == 0 {
            self.data_before_connected.store(true, Ordering::SeqCst);
        }
        self.received.lock().extend_from_slice(buffer.as_slice());
        if self.echo {
            ctx.write(Buffer::copy_from_slice(buffer.as_slice()))?;
        }
        ctx.free(buffer);
        Ok(())
    }

    fn on_connected(&self, ctx: &Context) -> Result<(), CoreError> {
        self.connected.fetch_add(1, Ordering::SeqCst);
        *self.pipeline.lock() = Some(ctx.pipeline().clone());
        if let Some(text) = self.greeting {
            ctx.write(Buffer::copy_from_slice(text))?;
        }
        if self.close_after_greeting {
            return ctx.close();
        }
        ctx.fire_connected()
    }

    fn on_close(&self, ctx: &Context) -> Result<(), CoreError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        ctx.close()
    }

    fn on_error(&self, ctx: &Context, error: CoreError) {
        self.errors.lock().push(error.code());
        ctx.fire_error(error);
    }
}

/// 加入流水线后把一组 Handler 按顺序安装到自身之后，然后移除自身。
pub struct Install {
    handlers: Box<dyn Fn() -> Vec<Arc<dyn Handler>> + Send + Sync>,
}

impl Install {
    pub fn new(handlers: impl Fn() -> Vec<Arc<dyn Handler>> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handlers: Box::new(handlers),
        })
    }
}

impl Handler for Install {
    fn name(&self) -> &'static str {
        "install"
    }

    fn handler_added(&self, ctx: &Context) -> Result<(), CoreError> {
        for handler in (self.handlers)().into_iter().rev() {
            ctx.add_after(handler)?;
        }
        ctx.remove()
    }
}
