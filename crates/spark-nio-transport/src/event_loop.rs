//! 单线程、就绪驱动的事件循环。
//!
//! # 模块定位（Why）
//! - 一个循环独占一个 `mio::Poll` 与一条专用线程，注册在其上的连接回调全部在这条线程上串行执行；
//! - 循环只持有注册表（令牌 → 注册项），不拥有连接本身。
//!
//! # 结构（How）
//! - `Selector`：可被原子替换的 `Registry` + `Waker`，重建多路复用器时整体换新；
//! - `entries`：`DashMap` 注册表，任意线程可注册，循环线程按令牌查找；
//! - `tasks`：跨线程投递的任务队列，每轮等待前清空执行；
//! - 分派边界以 `catch_unwind` 兜底，单个连接的错误或 panic 只会转化为该连接的错误事件。

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, ReentrantMutex};
use spark_nio_buffer::BufferPool;
use spark_nio_core::{CoreError, ErrorKind, Executor, codes};
use tracing::{debug, info, trace, warn};

use crate::config::EventLoopConfig;
use crate::error::{REGISTER, START, map_io_error, not_running};

const WAKER: Token = Token(0);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// 事件循环状态：`Ready → Running → Closed`，每步只发生一次。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopStatus {
    Ready,
    Running,
    Closed,
}

impl LoopStatus {
    const fn as_u8(self) -> u8 {
        match self {
            LoopStatus::Ready => 0,
            LoopStatus::Running => 1,
            LoopStatus::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopStatus::Ready,
            1 => LoopStatus::Running,
            _ => LoopStatus::Closed,
        }
    }
}

/// 一次就绪通知的快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// 已建立或正在建立的连接；重建时被关闭。
    Stream,
    /// 监听器；重建时迁移到新的多路复用器。
    Listener,
}

/// 注册在循环上的 I/O 源及其就绪回调。
///
/// 连接与监听器由本 crate 实现；自定义 I/O 源可实现它后经 [`EventLoop::register`] 接入。
/// 除 `register` 外的方法只在循环线程上调用。
pub trait Registration: Send + Sync + 'static {
    fn kind(&self) -> SourceKind;

    fn register(&self, registry: &Registry, token: Token) -> io::Result<()>;

    fn deregister(&self, registry: &Registry) -> io::Result<()>;

    /// 就绪回调，只在循环线程上调用。
    fn ready(&self, readiness: Readiness) -> Result<(), CoreError>;

    /// 把分派边界捕获的错误交给注册项处理（连接：转为流水线错误事件）。
    fn fault(&self, error: CoreError);

    /// 循环关闭或重建时关闭底层资源。
    fn shutdown(&self);
}

struct Selector {
    registry: Registry,
    waker: Waker,
}

impl Selector {
    fn open() -> io::Result<(Poll, Self)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let registry = poll.registry().try_clone()?;
        Ok((poll, Self { registry, waker }))
    }
}

/// 事件循环句柄，可廉价克隆并跨线程共享。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 以一条线程驱动任意多条非阻塞连接，连接回调无需为流水线内状态加锁；
/// - 多路复用器偶发“空转”（未超时却没有任何事件）时，按阈值重建它。
///
/// ## 逻辑（How）
/// - `start` 把状态从 `Ready` 切到 `Running` 并启动循环线程；
/// - 每轮：执行排队任务 → 以 `select_timeout` 为上限等待 → 逐个分派就绪事件；
/// - 连续“提前返回且无事件”的次数达到 `rebuild_threshold` 即重建：关闭所有连接，
///   监听器迁移到新 `Poll`，并原子替换 `Registry`/`Waker`；
/// - `close` 把状态切到 `Closed` 并唤醒循环线程；线程在处理完当前批次后退出，
///   退出前关闭仍在注册表中的全部 I/O 源。
///
/// ## 契约（What）
/// - `register` 仅在 `Running` 状态下成功，成功后唤醒多路复用器；
/// - `execute` 在 `Ready`/`Running` 状态下接受任务，任务在循环线程上按提交顺序执行；
/// - 共享默认循环拒绝 `close`，返回 `spark.nio.event_loop.shared_close`；
/// - 回调中的错误与 panic 在分派边界被捕获，不会终止循环线程。
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    config: EventLoopConfig,
    shared: bool,
    status: AtomicU8,
    selector: ArcSwap<Selector>,
    /// `register`、重建与收尾互斥：注册项要么进入重建快照，要么落在新的多路复用器上。
    /// 可重入，重建时关闭连接触发的回调仍可在循环线程上注册。
    gate: ReentrantMutex<()>,
    poll: Mutex<Option<Poll>>,
    entries: DashMap<Token, Arc<dyn Registration>>,
    tasks: Mutex<VecDeque<Task>>,
    next_token: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
    rebuild_requested: AtomicBool,
    rebuilds: AtomicU64,
    pool: BufferPool,
}

impl EventLoop {
    /// 以独立缓冲池创建循环（尚未启动）。
    pub fn new(config: EventLoopConfig) -> Result<Self, CoreError> {
        Self::create(config, None, false)
    }

    /// 与其它组件共用同一个缓冲池。
    pub fn with_pool(config: EventLoopConfig, pool: BufferPool) -> Result<Self, CoreError> {
        Self::create(config, Some(pool), false)
    }

    pub(crate) fn shared(config: EventLoopConfig) -> Result<Self, CoreError> {
        Self::create(config, None, true)
    }

    fn create(
        config: EventLoopConfig,
        pool: Option<BufferPool>,
        shared: bool,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let pool = match pool {
            Some(pool) => pool,
            None => BufferPool::new(config.pool.clone()).map_err(|error| {
                CoreError::new(ErrorKind::Resource, codes::EVENT_LOOP_START, "buffer pool creation failed")
                    .with_cause(error)
            })?,
        };
        let (poll, selector) = Selector::open().map_err(|error| map_io_error(START, error))?;
        Ok(Self {
            inner: Arc::new(LoopInner {
                config,
                shared,
                status: AtomicU8::new(LoopStatus::Ready.as_u8()),
                selector: ArcSwap::from_pointee(selector),
                gate: ReentrantMutex::new(()),
                poll: Mutex::new(Some(poll)),
                entries: DashMap::new(),
                tasks: Mutex::new(VecDeque::new()),
                next_token: AtomicUsize::new(WAKER.0 + 1),
                thread: Mutex::new(None),
                thread_id: OnceLock::new(),
                rebuild_requested: AtomicBool::new(false),
                rebuilds: AtomicU64::new(0),
                pool,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.inner.config
    }

    pub fn status(&self) -> LoopStatus {
        self.inner.status()
    }

    /// 是否为共享默认循环。
    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// 注册在本循环上的连接与监听器数量。
    pub fn registrations(&self) -> usize {
        self.inner.entries.len()
    }

    /// 已发生的多路复用器重建次数。
    pub fn rebuild_count(&self) -> u64 {
        self.inner.rebuilds.load(Ordering::Acquire)
    }

    /// 连接共用的缓冲池。
    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// `Ready → Running`，并启动循环线程。
    pub fn start(&self) -> Result<(), CoreError> {
        if self
            .inner
            .transition(LoopStatus::Ready, LoopStatus::Running)
            .is_err()
        {
            return Err(CoreError::invalid_state(
                codes::EVENT_LOOP_START,
                format!("event loop cannot start from status {:?}", self.status()),
            ));
        }
        let Some(poll) = self.inner.poll.lock().take() else {
            return Err(not_running(self.status()));
        };
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(self.inner.config.name.clone())
            .spawn(move || inner.run(poll));
        match spawned {
            Ok(handle) => {
                let _ = self.inner.thread_id.set(handle.thread().id());
                *self.inner.thread.lock() = Some(handle);
                Ok(())
            }
            Err(error) => {
                self.inner
                    .status
                    .store(LoopStatus::Closed.as_u8(), Ordering::Release);
                Err(map_io_error(START, error))
            }
        }
    }

    /// `Running → Closed`（或尚未启动时 `Ready → Closed`），只生效一次。
    pub fn close(&self) -> Result<(), CoreError> {
        if self.inner.shared {
            return Err(CoreError::invalid_state(
                codes::EVENT_LOOP_SHARED,
                "the shared default event loop cannot be closed",
            ));
        }
        if self
            .inner
            .transition(LoopStatus::Running, LoopStatus::Closed)
            .is_ok()
        {
            info!(event_loop = %self.name(), "event loop closing");
            self.inner.wake();
        } else if self
            .inner
            .transition(LoopStatus::Ready, LoopStatus::Closed)
            .is_ok()
        {
            debug!(event_loop = %self.name(), "event loop closed before start");
        } else {
            debug!(event_loop = %self.name(), "event loop already closed");
        }
        Ok(())
    }

    /// 等待循环线程退出；不能在循环线程内调用。
    pub fn join(&self) -> Result<(), CoreError> {
        if self.in_event_loop() {
            return Err(CoreError::invalid_state(
                codes::EVENT_LOOP_NOT_RUNNING,
                "event loop cannot join itself",
            ));
        }
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(event_loop = %self.name(), "event loop thread panicked");
        }
        Ok(())
    }

    /// 请求在下一轮重建多路复用器。
    pub fn rebuild(&self) -> Result<(), CoreError> {
        if self.status() != LoopStatus::Running {
            return Err(not_running(self.status()));
        }
        self.inner.rebuild_requested.store(true, Ordering::Release);
        self.inner.wake();
        Ok(())
    }

    /// 当前线程是否为循环线程。
    pub fn in_event_loop(&self) -> bool {
        self.inner.thread_id.get() == Some(&thread::current().id())
    }

    /// 投递任务到循环线程。
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), CoreError> {
        self.inner.submit(Box::new(task))
    }

    /// 把 I/O 源加入循环；仅在 `Running` 状态下成功，成功后唤醒多路复用器。
    pub fn register(&self, registration: Arc<dyn Registration>) -> Result<Token, CoreError> {
        let _gate = self.inner.gate.lock();
        let status = self.status();
        if status != LoopStatus::Running {
            return Err(not_running(status));
        }
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.inner.entries.insert(token, Arc::clone(&registration));
        let selector = self.inner.selector.load();
        if let Err(error) = registration.register(&selector.registry, token) {
            self.inner.entries.remove(&token);
            return Err(map_io_error(REGISTER, error));
        }
        trace!(event_loop = %self.name(), token = token.0, "registered");
        self.inner.wake();
        Ok(token)
    }

    /// 移除注册项（底层源已由调用方注销）。
    pub fn remove(&self, token: Token) {
        if self.inner.entries.remove(&token).is_some() {
            trace!(event_loop = %self.name(), token = token.0, "deregistered");
        }
    }

    /// 以当前多路复用器的 `Registry` 执行操作（重建后自动指向新实例）。
    pub fn with_registry<R>(&self, action: impl FnOnce(&Registry) -> R) -> R {
        let selector = self.inner.selector.load();
        action(&selector.registry)
    }
}

impl Executor for EventLoop {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), CoreError> {
        self.inner.submit(task)
    }

    fn in_event_loop(&self) -> bool {
        EventLoop::in_event_loop(self)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("shared", &self.is_shared())
            .field("registrations", &self.registrations())
            .finish()
    }
}

impl LoopInner {
    fn status(&self) -> LoopStatus {
        LoopStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: LoopStatus, to: LoopStatus) -> Result<(), LoopStatus> {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LoopStatus::from_u8)
    }

    fn wake(&self) {
        if let Err(error) = self.selector.load().waker.wake() {
            warn!(event_loop = %self.config.name, %error, "failed to wake selector");
        }
    }

    fn submit(&self, task: Task) -> Result<(), CoreError> {
        let status = self.status();
        if status == LoopStatus::Closed {
            return Err(not_running(status));
        }
        self.tasks.lock().push_back(task);
        self.wake();
        Ok(())
    }

    fn run(self: Arc<Self>, mut poll: Poll) {
        let _ = self.thread_id.set(thread::current().id());
        let name = self.config.name.clone();
        let timeout = self.config.select_timeout;
        let mut events = Events::with_capacity(self.config.events_capacity);
        let mut spin = SpinDetector::new(self.config.rebuild_threshold);
        info!(event_loop = %name, "event loop started");

        while self.status() == LoopStatus::Running {
            self.run_tasks();
            if self.rebuild_requested.swap(false, Ordering::AcqRel) {
                self.rebuild(&mut poll);
                spin.reset();
            }

            let started = Instant::now();
            if let Err(error) = poll.poll(&mut events, Some(timeout)) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(event_loop = %name, %error, "select failed");
                if spin.record_failure() {
                    self.rebuild(&mut poll);
                }
                continue;
            }

            let mut woken = false;
            let mut dispatched = 0usize;
            for event in events.iter() {
                if event.token() == WAKER {
                    woken = true;
                    continue;
                }
                dispatched += 1;
                self.dispatch(event.token(), Readiness::from(event));
            }

            if spin.observe(dispatched, woken, started.elapsed(), timeout) {
                warn!(event_loop = %name, threshold = spin.threshold, "selector keeps spinning");
                self.rebuild(&mut poll);
            } else if spin.premature > 0 {
                trace!(
                    event_loop = %name,
                    premature = spin.premature,
                    "select returned early with no events"
                );
            }
        }

        self.shutdown();
        info!(event_loop = %name, "event loop stopped");
    }

    fn run_tasks(&self) {
        let batch = std::mem::take(&mut *self.tasks.lock());
        for task in batch {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!(event_loop = %self.config.name, "queued task panicked");
            }
        }
    }

    fn dispatch(&self, token: Token, readiness: Readiness) {
        let entry = self.entries.get(&token).map(|entry| Arc::clone(entry.value()));
        let Some(entry) = entry else {
            // mio 没有可单独取消的就绪键；已关闭的连接在移除令牌前就已注销。
            debug!(event_loop = %self.config.name, token = token.0, "readiness for unknown registration");
            return;
        };
        guard(entry.as_ref(), || entry.ready(readiness));
    }

    /// 关闭全部连接，监听器迁移到新的多路复用器。
    ///
    /// 关闭回调里新注册的源不在关闭快照中，与监听器一起迁移。
    fn rebuild(&self, poll: &mut Poll) {
        let _gate = self.gate.lock();
        let streams: Vec<(Token, Arc<dyn Registration>)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().kind() == SourceKind::Stream)
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let closed = streams.len();
        for (token, entry) in &streams {
            shutdown_guarded(entry.as_ref());
            self.entries.remove(token);
        }

        let (new_poll, selector) = match Selector::open() {
            Ok(opened) => opened,
            Err(error) => {
                warn!(event_loop = %self.config.name, %error, "selector rebuild failed");
                return;
            }
        };
        let remaining: Vec<(Token, Arc<dyn Registration>)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut migrated = 0usize;
        for (token, entry) in &remaining {
            if let Err(error) = entry.deregister(poll.registry()) {
                debug!(token = token.0, %error, "deregister from old selector failed");
            }
            match entry.register(&selector.registry, *token) {
                Ok(()) => migrated += 1,
                Err(error) => {
                    warn!(token = token.0, kind = ?entry.kind(), %error, "migration failed");
                    self.entries.remove(token);
                    shutdown_guarded(entry.as_ref());
                }
            }
        }

        *poll = new_poll;
        self.selector.store(Arc::new(selector));
        self.rebuilds.fetch_add(1, Ordering::AcqRel);
        warn!(event_loop = %self.config.name, closed, migrated, "selector rebuilt");
    }

    fn shutdown(&self) {
        let _gate = self.gate.lock();
        let dropped = std::mem::take(&mut *self.tasks.lock()).len();
        if dropped > 0 {
            debug!(event_loop = %self.config.name, dropped, "discarding queued tasks");
        }
        let registered: Vec<Arc<dyn Registration>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in &registered {
            shutdown_guarded(entry.as_ref());
        }
        self.entries.clear();
    }
}

/// 统计连续“未超时却一无所获”的等待，达到阈值即要求重建。
#[derive(Debug)]
struct SpinDetector {
    premature: u32,
    threshold: u32,
}

impl SpinDetector {
    fn new(threshold: u32) -> Self {
        Self {
            premature: 0,
            threshold,
        }
    }

    /// 记录一轮等待的结果；返回 `true` 时计数已清零，调用方应当重建。
    fn observe(
        &mut self,
        dispatched: usize,
        woken: bool,
        elapsed: Duration,
        timeout: Duration,
    ) -> bool {
        if dispatched > 0 || woken || elapsed >= timeout {
            self.premature = 0;
            return false;
        }
        self.bump()
    }

    /// `poll` 本身出错同样计入。
    fn record_failure(&mut self) -> bool {
        self.bump()
    }

    fn reset(&mut self) {
        self.premature = 0;
    }

    fn bump(&mut self) -> bool {
        self.premature += 1;
        if self.premature >= self.threshold {
            self.premature = 0;
            return true;
        }
        false
    }
}

/// 分派边界：回调返回的错误与 panic 都交给注册项的 `fault`。
pub(crate) fn guard(registration: &dyn Registration, action: impl FnOnce() -> Result<(), CoreError>) {
    let error = match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(%message, "handler panicked at dispatch boundary");
            CoreError::invalid_state(codes::HANDLER_PANICKED, format!("handler panicked: {message}"))
        }
    };
    debug!(code = error.code(), %error, "dispatch failed");
    if panic::catch_unwind(AssertUnwindSafe(|| registration.fault(error))).is_err() {
        warn!("error handling panicked, closing registration");
        shutdown_guarded(registration);
    }
}

fn shutdown_guarded(registration: &dyn Registration) {
    if panic::catch_unwind(AssertUnwindSafe(|| registration.shutdown())).is_err() {
        warn!("registration shutdown panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
