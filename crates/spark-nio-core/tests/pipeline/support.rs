//! 流水线测试共用的记录型通道与 Handler。
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use spark_nio_buffer::PoolConfig;
use spark_nio_core::{Buffer, BufferPool, Channel, Context, CoreError, Handler, Pipeline, codes};

/// 记录写出、连接与关闭次数的内存通道。
#[derive(Default)]
pub struct RecordingChannel {
    writes: Mutex<Vec<Vec<u8>>>,
    connects: Mutex<Vec<SocketAddr>>,
    closes: AtomicUsize,
    closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl RecordingChannel {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn connects(&self) -> Vec<SocketAddr> {
        self.connects.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl Channel for RecordingChannel {
    fn write(&self, buffer: &mut Buffer) -> Result<(), CoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::io(
                codes::CHANNEL_WRITE,
                "mock write",
                std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            ));
        }
        let data = buffer.to_vec();
        buffer.advance(data.len());
        self.writes.lock().push(data);
        Ok(())
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), CoreError> {
        self.connects.lock().push(addr);
        Ok(())
    }

    fn close(&self) -> Result<(), CoreError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

pub fn pool() -> BufferPool {
    BufferPool::new(PoolConfig::default().with_sweeper(false)).expect("构造缓冲池失败")
}

pub fn pipeline() -> (Pipeline, Arc<RecordingChannel>) {
    let channel = Arc::new(RecordingChannel::default());
    let pipeline = Pipeline::new(channel.clone(), pool());
    (pipeline, channel)
}

/// 事件日志，元素形如 `"A:receive:ping"`。
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

/// 记录全部事件并原样转发的 Handler。
pub struct Recorder {
    pub label: &'static str,
    pub journal: Journal,
}

impl Recorder {
    pub fn new(label: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            label,
            journal: journal.clone(),
        })
    }
}

impl Handler for Recorder {
    fn name(&self) -> &'static str {
        self.label
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        let text = if buffer.is_end_of_stream() {
            "<eos>".to_owned()
        } else {
            String::from_utf8_lossy(buffer.as_slice()).into_owned()
        };
        self.journal.push(format!("{}:receive:{text}", self.label));
        ctx.fire_receive(buffer)
    }

    fn on_write(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        let text = String::from_utf8_lossy(buffer.as_slice()).into_owned();
        self.journal.push(format!("{}:write:{text}", self.label));
        ctx.write(buffer)
    }

    fn on_connected(&self, ctx: &Context) -> Result<(), CoreError> {
        self.journal.push(format!("{}:connected", self.label));
        ctx.fire_connected()
    }

    fn on_close(&self, ctx: &Context) -> Result<(), CoreError> {
        self.journal.push(format!("{}:close", self.label));
        ctx.close()
    }

    fn on_read_terminated(&self, ctx: &Context) -> Result<(), CoreError> {
        self.journal.push(format!("{}:read_terminated", self.label));
        ctx.fire_read_terminated()
    }

    fn on_error(&self, ctx: &Context, error: CoreError) {
        self.journal.push(format!("{}:error:{}", self.label, error.code()));
        ctx.fire_error(error);
    }
}

pub fn bytes(text: &str) -> Buffer {
    Buffer::copy_from_slice(text.as_bytes())
}
