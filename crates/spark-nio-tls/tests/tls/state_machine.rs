//! 适配器状态机：委托任务、排队写、记录分片重组与缓冲增长。
//!
//! # 教案级说明
//! - **意图（Why）**：`rustls` 不产生委托任务，也很少触发溢出；以一个行为可预测的分帧引擎
//!   覆盖这些分支；
//! - **结构（How）**：`FramingEngine` 的握手是“一个委托任务 + 一次 `wrap` 产出 `HELLO`”，
//!   之后每条记录是 2 字节长度前缀加明文。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use spark_nio_buffer::Buffer;
use spark_nio_core::{CoreError, Pipeline};
use spark_nio_tls::{
    DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, Role, TlsAdapter, TlsEngine, codes,
};
use support::{Inbox, Wire, pool};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Task,
    Done,
}

struct FramingEngine {
    stage: Stage,
    task_taken: bool,
    task_ran: Arc<AtomicBool>,
    finished_reported: bool,
    outbound_closed: bool,
    /// 为真时任何输入都不足以成帧，残余只增不减。
    unframed: bool,
}

impl FramingEngine {
    fn new(task_ran: Arc<AtomicBool>) -> Self {
        Self {
            stage: Stage::Idle,
            task_taken: false,
            task_ran,
            finished_reported: false,
            outbound_closed: false,
            unframed: false,
        }
    }

    fn unframed(task_ran: Arc<AtomicBool>) -> Self {
        Self {
            unframed: true,
            ..Self::new(task_ran)
        }
    }

    fn result(&mut self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        let mut handshake_status = self.handshake_status();
        if self.stage == Stage::Done && !self.finished_reported {
            self.finished_reported = true;
            handshake_status = HandshakeStatus::Finished;
        }
        EngineResult {
            status,
            handshake_status,
            bytes_consumed: consumed,
            bytes_produced: produced,
        }
    }
}

impl TlsEngine for FramingEngine {
    fn role(&self) -> Role {
        Role::Client
    }

    fn begin_handshake(&mut self) -> Result<(), CoreError> {
        self.stage = Stage::Task;
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.stage {
            Stage::Task if self.task_ran.load(Ordering::SeqCst) => HandshakeStatus::NeedWrap,
            Stage::Task => HandshakeStatus::NeedTask,
            Stage::Idle | Stage::Done => HandshakeStatus::NotHandshaking,
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, CoreError> {
        if matches!(self.handshake_status(), HandshakeStatus::NeedWrap) {
            self.stage = Stage::Done;
            let produced = dst.put_slice(b"HELLO");
            return Ok(self.result(EngineStatus::Ok, 0, produced));
        }
        if self.outbound_closed {
            let produced = dst.put_slice(b"BYE");
            return Ok(self.result(EngineStatus::Closed, 0, produced));
        }
        if self.stage != Stage::Done || src.is_empty() {
            return Ok(self.result(EngineStatus::Ok, 0, 0));
        }
        let len = src.len().min(u16::MAX as usize);
        if dst.spare_capacity() < len + 2 {
            return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
        }
        dst.put_slice(&(len as u16).to_be_bytes());
        dst.put_slice(&src[..len]);
        Ok(self.result(EngineStatus::Ok, len, len + 2))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, CoreError> {
        if self.unframed || self.stage != Stage::Done || src.len() < 2 {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < len + 2 {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        if dst.spare_capacity() < len {
            return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
        }
        dst.put_slice(&src[2..2 + len]);
        Ok(self.result(EngineStatus::Ok, len + 2, len))
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if self.stage != Stage::Task || self.task_taken {
            return None;
        }
        self.task_taken = true;
        let flag = Arc::clone(&self.task_ran);
        Some(Box::new(move || flag.store(true, Ordering::SeqCst)))
    }

    fn application_buffer_size(&self) -> usize {
        1000
    }

    fn packet_buffer_size(&self) -> usize {
        1000
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }
}

struct Fixture {
    pipeline: Pipeline,
    wire: Arc<Wire>,
    inbox: Arc<Inbox>,
    adapter: Arc<TlsAdapter>,
    task_ran: Arc<AtomicBool>,
}

fn fixture(inbox: Arc<Inbox>) -> Fixture {
    fixture_with(inbox, FramingEngine::new)
}

fn fixture_with(inbox: Arc<Inbox>, engine: fn(Arc<AtomicBool>) -> FramingEngine) -> Fixture {
    let task_ran = Arc::new(AtomicBool::new(false));
    let adapter = Arc::new(TlsAdapter::new(Box::new(engine(task_ran.clone()))));
    let wire = Arc::new(Wire::default());
    let pipeline = Pipeline::new(wire.clone(), pool());
    pipeline.add_last(adapter.clone()).expect("安装适配器失败");
    pipeline.add_last(inbox.clone()).expect("安装收件箱失败");
    Fixture {
        pipeline,
        wire,
        inbox,
        adapter,
        task_ran,
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut record = (payload.len() as u16).to_be_bytes().to_vec();
    record.extend_from_slice(payload);
    record
}

#[test]
fn delegated_task_runs_before_handshake_completes() {
    let fx = fixture(Inbox::default().into());
    fx.pipeline.fire_connected().expect("connected 失败");

    assert!(fx.task_ran.load(Ordering::SeqCst), "NeedTask 时必须执行委托任务");
    assert!(fx.adapter.is_established());
    assert_eq!(fx.inbox.connected(), 1);
    assert_eq!(fx.wire.drain(), b"HELLO");

    fx.pipeline.fire_connected().expect("重复 connected 失败");
    assert_eq!(fx.inbox.connected(), 1, "connected 只通知一次");
}

#[test]
fn queued_writes_follow_handshake_flight_and_precede_callback_writes() {
    let fx = fixture(Inbox::greeting(b"hi"));
    fx.pipeline
        .write(Buffer::copy_from_slice(b"queued"))
        .expect("握手前写入失败");

    let mut expected = b"HELLO".to_vec();
    expected.extend(frame(b"queued"));
    expected.extend(frame(b"hi"));
    assert_eq!(fx.wire.drain(), expected);
    assert_eq!(fx.inbox.connected(), 1);
}

#[test]
fn fragmented_records_are_reassembled_from_residual() {
    let fx = fixture(Inbox::default().into());
    fx.pipeline.fire_connected().expect("connected 失败");

    let record = frame(b"split across segments");
    for byte in &record[..record.len() - 1] {
        fx.pipeline
            .fire_receive(Buffer::copy_from_slice(&[*byte]))
            .expect("投递分片失败");
    }
    assert_eq!(fx.inbox.received(), b"", "记录不完整时不得交付明文");

    fx.pipeline
        .fire_receive(Buffer::copy_from_slice(&record[record.len() - 1..]))
        .expect("投递末字节失败");
    assert_eq!(fx.inbox.received(), b"split across segments");
}

#[test]
fn several_records_in_one_segment_are_delivered_separately() {
    let fx = fixture(Inbox::default().into());
    fx.pipeline.fire_connected().expect("connected 失败");

    let mut segment = frame(b"one,");
    segment.extend(frame(b"two,"));
    segment.extend(&frame(b"three")[..3]);
    fx.pipeline
        .fire_receive(Buffer::copy_from_slice(&segment))
        .expect("投递失败");
    assert_eq!(fx.inbox.received(), b"one,two,");

    fx.pipeline
        .fire_receive(Buffer::copy_from_slice(&frame(b"three")[3..]))
        .expect("投递剩余失败");
    assert_eq!(fx.inbox.received(), b"one,two,three");
}

#[test]
fn overflow_doubles_buffer_sizes() {
    let fx = fixture(Inbox::default().into());
    fx.pipeline.fire_connected().expect("connected 失败");
    fx.wire.drain();
    assert_eq!(fx.adapter.buffer_sizes(), (1024, 1024));

    let data = vec![7u8; 3000];
    fx.pipeline
        .write(Buffer::copy_from_slice(&data))
        .expect("写入失败");
    assert_eq!(fx.wire.drain(), frame(&data));
    assert_eq!(fx.adapter.buffer_sizes().1, 4096);

    fx.pipeline
        .fire_receive(Buffer::copy_from_slice(&frame(&data)))
        .expect("投递失败");
    assert_eq!(fx.inbox.received(), data);
    assert_eq!(fx.adapter.buffer_sizes().0, 4096);
}

#[test]
fn residual_growth_stops_at_the_buffer_limit() {
    let fx = fixture_with(Inbox::default().into(), FramingEngine::unframed);
    fx.pipeline.fire_connected().expect("connected 失败");
    fx.wire.drain();

    let chunk = vec![0u8; 1024 * 1024];
    let mut delivered = 0;
    let error = loop {
        match fx.pipeline.fire_receive(Buffer::copy_from_slice(&chunk)) {
            Ok(()) => delivered += 1,
            Err(error) => break error,
        }
        assert!(delivered <= 16, "残余超过上限后仍在增长");
    };
    assert_eq!(error.code(), codes::BUFFER_LIMIT);
    assert_eq!(delivered, 16, "16 MiB 以内的残余应当被接纳");
    assert_eq!(fx.adapter.buffer_sizes().1, 16 * 1024 * 1024);
    assert_eq!(fx.inbox.received(), b"");
}

#[test]
fn close_emits_closing_record_before_closing_channel() {
    let fx = fixture(Inbox::default().into());
    fx.pipeline.fire_connected().expect("connected 失败");
    fx.wire.drain();

    fx.pipeline.close().expect("关闭失败");
    assert_eq!(fx.wire.drain(), b"BYE");
    assert_eq!(fx.wire.closes(), 1);
}

#[test]
fn end_of_stream_passes_through() {
    let fx = fixture(Inbox::default().into());
    fx.pipeline.fire_connected().expect("connected 失败");
    fx.pipeline
        .fire_receive(Buffer::end_of_stream())
        .expect("EOS 应直通");
    assert_eq!(fx.inbox.received(), b"");
}
