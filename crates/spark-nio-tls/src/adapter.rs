use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use spark_nio_buffer::{Buffer, BufferPool, size_for};
use spark_nio_core::{Context, CoreError, Handler};
use tracing::{debug, trace};

use crate::engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
use crate::error::{codes, tls_error};

/// 缓冲尺寸翻倍增长的上限。
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// 位于流水线中的 TLS 记录层适配器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 对下游（靠近尾部）的应用 Handler 呈现明文与“握手完成才算已连接”的语义，
///   对上游（靠近头部）只交换密文；
/// - 握手推进完全由引擎报告的 [`HandshakeStatus`] 驱动，适配器本身不理解任何握手消息。
///
/// ## 逻辑（How）
/// - `on_connected`：开启握手，按引擎需要发出首个 `wrap`/`unwrap`，并**不**向下游转发；
/// - `on_receive`：把上次未消费的残余字节与新数据拼接后循环 `unwrap`，每段非空明文单独转发；
///   `BufferUnderflow` 或无进展时停止并保留残余；`BufferOverflow` 时把明文缓冲尺寸翻倍；
/// - `on_write`：握手完成前排队，完成后循环 `wrap` 直到应用字节全部消费；
/// - 每次操作后执行握手检查循环：`NeedTask` 同步执行全部委托任务，`NeedWrap`/`NeedUnwrap`
///   以空输入推进，直到完成或被网络阻塞；
/// - 握手完成时只触发一次 `fire_connected`：先把排队的应用写加密送出，再通知下游，
///   随后释放握手期间解出的早到明文。
///
/// ## 契约（What）
/// - 会话状态受 `parking_lot::Mutex` 保护，锁内只调用引擎与缓冲池，转发事件一律在锁外进行，
///   下游回调可以重入调用 `write`；
/// - 产出的密文进入有序队列，由唯一的冲刷者按引擎产出顺序写往上游，重入写入的记录不会插队；
/// - 缓冲尺寸取自引擎建议值并按 1 KiB 向上取整，会话内只增不减。
///
/// ## 风险与权衡（Trade-offs）
/// - 单次 `on_receive` 解出的明文在锁释放后才转发，占用的缓冲上限是一次读入的数据量。
pub struct TlsAdapter {
    session: Mutex<Session>,
}

impl TlsAdapter {
    pub fn new(engine: Box<dyn TlsEngine>) -> Self {
        Self {
            session: Mutex::new(Session::new(engine)),
        }
    }

    /// 握手是否已经完成。
    pub fn is_established(&self) -> bool {
        self.session.lock().finished
    }

    /// 当前（明文，密文）缓冲尺寸。
    pub fn buffer_sizes(&self) -> (usize, usize) {
        let session = self.session.lock();
        (session.app_size, session.packet_size)
    }

    fn drive<F>(&self, ctx: &Context, step: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut Session, &BufferPool, &mut Vec<Inbound>) -> Result<(), CoreError>,
    {
        let mut inbound = Vec::new();
        let outcome = {
            let mut session = self.session.lock();
            step(&mut *session, ctx.pipeline().pool(), &mut inbound)
        };
        self.flush(ctx)?;
        outcome?;
        for event in inbound {
            match event {
                Inbound::Data(buffer) => ctx.fire_receive(buffer)?,
                Inbound::Connected => ctx.fire_connected()?,
            }
        }
        Ok(())
    }

    /// 按产出顺序把密文写往上游；重入调用只负责入队。
    fn flush(&self, ctx: &Context) -> Result<(), CoreError> {
        {
            let mut session = self.session.lock();
            if session.flushing {
                return Ok(());
            }
            session.flushing = true;
        }
        let outcome = loop {
            let next = self.session.lock().outbound.pop_front();
            let Some(record) = next else {
                break Ok(());
            };
            if let Err(error) = ctx.write(record) {
                break Err(error);
            }
        };
        self.session.lock().flushing = false;
        outcome
    }
}

impl Handler for TlsAdapter {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn on_connected(&self, ctx: &Context) -> Result<(), CoreError> {
        self.drive(ctx, |session, pool, inbound| session.start(pool, inbound))
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        if buffer.is_end_of_stream() {
            self.session.lock().engine.close_inbound();
            return ctx.fire_receive(buffer);
        }
        self.drive(ctx, |session, pool, inbound| {
            session.receive(pool, buffer, inbound)
        })
    }

    fn on_write(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        self.drive(ctx, |session, pool, inbound| session.write(pool, buffer, inbound))
    }

    fn on_close(&self, ctx: &Context) -> Result<(), CoreError> {
        let notified = self.drive(ctx, |session, pool, inbound| {
            session.close_notify(pool, inbound)
        });
        if let Err(error) = notified {
            debug!(
                pipeline = ctx.pipeline().id(),
                code = error.code(),
                %error,
                "close_notify not sent"
            );
        }
        ctx.close()
    }
}

impl fmt::Debug for TlsAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.lock();
        f.debug_struct("TlsAdapter")
            .field("engine", &session.engine)
            .field("finished", &session.finished)
            .field("app_size", &session.app_size)
            .field("packet_size", &session.packet_size)
            .field("pending_writes", &session.pending_writes.len())
            .finish()
    }
}

enum Inbound {
    Data(Buffer),
    Connected,
}

struct Session {
    engine: Box<dyn TlsEngine>,
    app_size: usize,
    packet_size: usize,
    residual: Option<Buffer>,
    started: bool,
    finished: bool,
    pending_writes: VecDeque<Buffer>,
    early: Vec<Buffer>,
    outbound: VecDeque<Buffer>,
    flushing: bool,
}

impl Session {
    fn new(engine: Box<dyn TlsEngine>) -> Self {
        let app_size = size_for(engine.application_buffer_size());
        let packet_size = size_for(engine.packet_buffer_size());
        Self {
            engine,
            app_size,
            packet_size,
            residual: None,
            started: false,
            finished: false,
            pending_writes: VecDeque::new(),
            early: Vec::new(),
            outbound: VecDeque::new(),
            flushing: false,
        }
    }

    fn start(&mut self, pool: &BufferPool, inbound: &mut Vec<Inbound>) -> Result<(), CoreError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.engine.begin_handshake()?;
        trace!(role = ?self.engine.role(), "tls handshake started");
        let result = match self.engine.handshake_status() {
            HandshakeStatus::NeedWrap => self.wrap_step(pool, &[], inbound)?,
            HandshakeStatus::NeedUnwrap => self.unwrap_step(pool, None, inbound)?,
            HandshakeStatus::NeedTask => EngineResult {
                status: EngineStatus::Ok,
                handshake_status: HandshakeStatus::NeedTask,
                bytes_consumed: 0,
                bytes_produced: 0,
            },
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => return Ok(()),
        };
        self.check_handshaking(pool, result, inbound)?;
        Ok(())
    }

    fn receive(
        &mut self,
        pool: &BufferPool,
        buffer: Buffer,
        inbound: &mut Vec<Inbound>,
    ) -> Result<(), CoreError> {
        self.start(pool, inbound)?;
        let result = self.unwrap_step(pool, Some(buffer), inbound)?;
        let result = self.check_handshaking(pool, result, inbound)?;
        // 与握手尾部记录同批到达的应用记录。
        if self.finished && !result.is_stalled() && self.residual.is_some() {
            let result = self.unwrap_step(pool, None, inbound)?;
            self.check_handshaking(pool, result, inbound)?;
        }
        Ok(())
    }

    fn write(
        &mut self,
        pool: &BufferPool,
        buffer: Buffer,
        inbound: &mut Vec<Inbound>,
    ) -> Result<(), CoreError> {
        if !self.finished {
            self.pending_writes.push_back(buffer);
            return self.start(pool, inbound);
        }
        if let Some(result) = self.wrap_all(pool, buffer, inbound)? {
            self.check_handshaking(pool, result, inbound)?;
        }
        Ok(())
    }

    fn close_notify(
        &mut self,
        pool: &BufferPool,
        inbound: &mut Vec<Inbound>,
    ) -> Result<(), CoreError> {
        if !self.started {
            return Ok(());
        }
        self.engine.close_outbound();
        self.wrap_step(pool, &[], inbound)?;
        Ok(())
    }

    /// 反复推进握手，直到完成或被网络阻塞。
    fn check_handshaking(
        &mut self,
        pool: &BufferPool,
        mut result: EngineResult,
        inbound: &mut Vec<Inbound>,
    ) -> Result<EngineResult, CoreError> {
        let mut status = result.handshake_status;
        loop {
            match status {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => break,
                HandshakeStatus::NeedTask => {
                    let mut ran = 0;
                    while let Some(task) = self.engine.delegated_task() {
                        task();
                        ran += 1;
                    }
                    trace!(tasks = ran, "tls delegated tasks completed");
                    status = self.engine.handshake_status();
                    if ran == 0 && status == HandshakeStatus::NeedTask {
                        break;
                    }
                    continue;
                }
                HandshakeStatus::NeedWrap => result = self.wrap_step(pool, &[], inbound)?,
                HandshakeStatus::NeedUnwrap => result = self.unwrap_step(pool, None, inbound)?,
            }
            status = result.handshake_status;
            if result.is_stalled() {
                break;
            }
        }
        Ok(result)
    }

    /// 一次逻辑 `wrap`：目标缓冲溢出时翻倍重试。
    fn wrap_step(
        &mut self,
        pool: &BufferPool,
        src: &[u8],
        inbound: &mut Vec<Inbound>,
    ) -> Result<EngineResult, CoreError> {
        let mut consumed = 0;
        let mut finished = false;
        let result = loop {
            let mut dst = pool.allocate(self.packet_size);
            let result = match self.engine.wrap(&src[consumed..], &mut dst) {
                Ok(result) => result,
                Err(error) => {
                    pool.free(dst);
                    return Err(error);
                }
            };
            consumed += result.bytes_consumed;
            finished |= result.handshake_status == HandshakeStatus::Finished;
            if dst.is_empty() {
                pool.free(dst);
            } else {
                self.outbound.push_back(dst);
            }
            match result.status {
                EngineStatus::BufferOverflow => {
                    self.packet_size = enlarge(self.packet_size)?;
                    trace!(packet_size = self.packet_size, "tls packet buffer enlarged");
                }
                EngineStatus::Closed => {
                    self.engine.close_outbound();
                    break result;
                }
                EngineStatus::Ok | EngineStatus::BufferUnderflow => break result,
            }
        };
        if finished {
            self.handshake_finished(pool, inbound)?;
        }
        Ok(settled(result, consumed, finished))
    }

    /// 加密整个应用缓冲；返回最后一次 `wrap` 的结果。
    fn wrap_all(
        &mut self,
        pool: &BufferPool,
        mut src: Buffer,
        inbound: &mut Vec<Inbound>,
    ) -> Result<Option<EngineResult>, CoreError> {
        let mut last = None;
        while !src.is_empty() {
            let result = match self.wrap_step(pool, src.as_slice(), inbound) {
                Ok(result) => result,
                Err(error) => {
                    pool.free(src);
                    return Err(error);
                }
            };
            src.advance(result.bytes_consumed);
            last = Some(result);
            if result.status == EngineStatus::Closed {
                break;
            }
            if result.bytes_consumed == 0 && !src.is_empty() {
                let remaining = src.remaining();
                pool.free(src);
                return Err(tls_error(
                    codes::DATA_REJECTED,
                    format!("tls engine refused {remaining} bytes of application data"),
                ));
            }
        }
        pool.free(src);
        Ok(last)
    }

    /// 一次逻辑 `unwrap`：循环解密残余与新数据，直到需要更多输入或握手需要介入。
    fn unwrap_step(
        &mut self,
        pool: &BufferPool,
        incoming: Option<Buffer>,
        inbound: &mut Vec<Inbound>,
    ) -> Result<EngineResult, CoreError> {
        let mut src = self.merge_residual(pool, incoming)?;
        let mut consumed = 0;
        let mut finished = false;
        let result = loop {
            let mut dst = pool.allocate(self.app_size);
            let result = match self.engine.unwrap(src.as_slice(), &mut dst) {
                Ok(result) => result,
                Err(error) => {
                    pool.free(dst);
                    pool.free(src);
                    return Err(error);
                }
            };
            src.advance(result.bytes_consumed);
            consumed += result.bytes_consumed;
            finished |= result.handshake_status == HandshakeStatus::Finished;
            if result.bytes_produced > 0 {
                self.deliver(dst, inbound);
            } else {
                pool.free(dst);
            }
            match result.status {
                EngineStatus::BufferUnderflow => break result,
                EngineStatus::BufferOverflow => {
                    match enlarge(self.app_size) {
                        Ok(size) => self.app_size = size,
                        Err(error) => {
                            pool.free(src);
                            return Err(error);
                        }
                    }
                    trace!(app_size = self.app_size, "tls application buffer enlarged");
                    continue;
                }
                EngineStatus::Closed => {
                    self.engine.close_inbound();
                    break result;
                }
                EngineStatus::Ok => {}
            }
            if result.is_stalled() || result.handshake_status != HandshakeStatus::NotHandshaking {
                break result;
            }
        };

        if src.is_empty() {
            pool.free(src);
        } else {
            self.residual = Some(src);
        }
        if finished {
            self.handshake_finished(pool, inbound)?;
        }
        Ok(settled(result, consumed, finished))
    }

    /// 拼接残余字节与新到数据；密文缓冲放不下时翻倍增长。
    ///
    /// 增长与溢出重试共用 [`enlarge`] 的上限：对端持续发送无法成帧的字节时，
    /// 以 `tls.buffer_limit` 失败，而不是无界地扩张缓冲。
    fn merge_residual(
        &mut self,
        pool: &BufferPool,
        incoming: Option<Buffer>,
    ) -> Result<Buffer, CoreError> {
        let residual = self.residual.take();
        match (residual, incoming) {
            (None, Some(incoming)) => Ok(incoming),
            (None, None) => Ok(Buffer::with_capacity(0)),
            (Some(residual), None) => Ok(residual),
            (Some(residual), Some(incoming)) if incoming.is_empty() => {
                pool.free(incoming);
                Ok(residual)
            }
            (Some(residual), Some(incoming)) => {
                let needed = residual.remaining().saturating_add(incoming.remaining());
                let mut size = self.packet_size;
                while size < needed {
                    match enlarge(size) {
                        Ok(enlarged) => size = enlarged,
                        Err(error) => {
                            pool.free(residual);
                            pool.free(incoming);
                            return Err(error);
                        }
                    }
                }
                if size != self.packet_size {
                    self.packet_size = size;
                    trace!(packet_size = size, "tls packet buffer enlarged");
                }
                let mut merged = pool.allocate(self.packet_size);
                merged.put_slice(residual.as_slice());
                merged.put_slice(incoming.as_slice());
                pool.free(residual);
                pool.free(incoming);
                Ok(merged)
            }
        }
    }

    fn deliver(&mut self, plaintext: Buffer, inbound: &mut Vec<Inbound>) {
        if self.finished {
            inbound.push(Inbound::Data(plaintext));
        } else {
            self.early.push(plaintext);
        }
    }

    fn handshake_finished(
        &mut self,
        pool: &BufferPool,
        inbound: &mut Vec<Inbound>,
    ) -> Result<(), CoreError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        debug!(
            role = ?self.engine.role(),
            queued = self.pending_writes.len(),
            "tls session established"
        );
        while let Some(buffer) = self.pending_writes.pop_front() {
            self.wrap_all(pool, buffer, inbound)?;
        }
        inbound.push(Inbound::Connected);
        inbound.extend(self.early.drain(..).map(Inbound::Data));
        Ok(())
    }
}

/// 把多次重试合并为一次逻辑结果：累计消费量，并保留握手完成标记。
fn settled(last: EngineResult, consumed: usize, finished: bool) -> EngineResult {
    EngineResult {
        bytes_consumed: consumed,
        handshake_status: if finished {
            HandshakeStatus::Finished
        } else {
            last.handshake_status
        },
        ..last
    }
}

fn enlarge(size: usize) -> Result<usize, CoreError> {
    let enlarged = size.saturating_mul(2);
    if enlarged > MAX_BUFFER_SIZE {
        return Err(tls_error(
            codes::BUFFER_LIMIT,
            format!("tls buffer would grow beyond {MAX_BUFFER_SIZE} bytes"),
        ));
    }
    Ok(enlarged)
}
