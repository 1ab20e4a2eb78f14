//! 连接适配器：把 mio 就绪事件翻译为流水线事件。
//!
//! - [`TcpConnection`] 实现 [`Channel`]，是头哨兵眼中的通道；
//! - `ConnectionEntry` 实现事件循环的注册项，持有通道与流水线，负责连接完成、读取与写回压。

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use socket2::SockRef;
use spark_nio_core::{Buffer, Channel, CoreError, Handler, Pipeline};
use tracing::{debug, trace, warn};

use crate::error::{CONNECT, WRITE, closed_channel, map_io_error};
use crate::event_loop::{EventLoop, Readiness, Registration, SourceKind};

/// 非阻塞 TCP 通道。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 写路径优先直写套接字，写不完的字节复制进待写队列并挂载写兴趣，
///   待写队列非空时后续写入一律排队，保证字节顺序；
/// - 连接建立前的写入同样排队，连接完成后先于 `connected` 事件刷出。
///
/// ## 契约（What）
/// - 读兴趣始终挂载（直到读方向终止），是否真正读取由流水线流控在读取前判定；
/// - `close` 尽力刷出待写字节后注销并释放套接字，可重复调用。
pub struct TcpConnection {
    event_loop: EventLoop,
    socket: Mutex<Socket>,
}

struct Socket {
    stream: Option<TcpStream>,
    token: Option<Token>,
    interest: Option<Interest>,
    pending: VecDeque<Buffer>,
    connecting: bool,
    read_closed: bool,
}

impl Socket {
    fn desired_interest(&self) -> Option<Interest> {
        let writable = self.connecting || !self.pending.is_empty();
        match (self.read_closed, writable) {
            (false, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, true) => Some(Interest::WRITABLE),
            (true, false) => None,
        }
    }

    /// 按当前状态重新计算兴趣集并同步到多路复用器。
    fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = self.desired_interest();
        if desired == self.interest {
            return Ok(());
        }
        let (Some(stream), Some(token)) = (self.stream.as_mut(), self.token) else {
            return Ok(());
        };
        match (self.interest, desired) {
            (None, Some(interest)) => registry.register(stream, token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(stream, token, interest)?,
            (Some(_), None) => registry.deregister(stream)?,
            (None, None) => {}
        }
        self.interest = desired;
        Ok(())
    }
}

enum ReadOutcome {
    Data,
    WouldBlock,
    EndOfStream,
    Closed,
}

impl TcpConnection {
    pub(crate) fn new(event_loop: EventLoop, stream: Option<TcpStream>) -> Self {
        if let Some(stream) = &stream {
            configure(stream);
        }
        Self {
            event_loop,
            socket: Mutex::new(Socket {
                stream,
                token: None,
                interest: None,
                pending: VecDeque::new(),
                connecting: false,
                read_closed: false,
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// 尚未刷出的待写字节数。
    pub fn pending_bytes(&self) -> usize {
        self.socket.lock().pending.iter().map(Buffer::remaining).sum()
    }

    fn is_connecting(&self) -> bool {
        self.socket.lock().connecting
    }

    fn bind_token(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut socket = self.socket.lock();
        socket.token = Some(token);
        socket.interest = None;
        socket.sync_interest(registry)
    }

    fn unbind(&self, registry: &Registry) -> io::Result<()> {
        let mut socket = self.socket.lock();
        if socket.interest.take().is_some()
            && let Some(stream) = socket.stream.as_mut()
        {
            registry.deregister(stream)?;
        }
        Ok(())
    }

    fn sync(&self, socket: &mut Socket) -> Result<(), CoreError> {
        self.event_loop
            .with_registry(|registry| socket.sync_interest(registry))
            .map_err(|error| map_io_error(WRITE, error))
    }

    /// 检查非阻塞连接是否完成；`Ok(false)` 表示仍在进行中。
    fn finish_connect(&self) -> Result<bool, CoreError> {
        let mut socket = self.socket.lock();
        let Some(stream) = socket.stream.as_ref() else {
            return Err(closed_channel());
        };
        if let Some(error) = stream
            .take_error()
            .map_err(|error| map_io_error(CONNECT, error))?
        {
            return Err(map_io_error(CONNECT, error));
        }
        match stream.peer_addr() {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::NotConnected => return Ok(false),
            Err(error) => return Err(map_io_error(CONNECT, error)),
        }
        socket.connecting = false;
        self.sync(&mut socket)?;
        Ok(true)
    }

    /// 刷出待写队列，全部写完后撤销写兴趣。
    fn flush_pending(&self) -> Result<(), CoreError> {
        let mut socket = self.socket.lock();
        if socket.connecting {
            return Ok(());
        }
        let Socket {
            stream, pending, ..
        } = &mut *socket;
        let Some(stream) = stream.as_mut() else {
            return Ok(());
        };
        while let Some(front) = pending.front_mut() {
            write_nonblocking(stream, front).map_err(|error| map_io_error(WRITE, error))?;
            if !front.is_empty() {
                break;
            }
            pending.pop_front();
        }
        self.sync(&mut socket)
    }

    fn read_into(&self, buffer: &mut Buffer) -> ReadOutcome {
        let mut socket = self.socket.lock();
        if socket.read_closed {
            return ReadOutcome::Closed;
        }
        let Some(stream) = socket.stream.as_mut() else {
            return ReadOutcome::Closed;
        };
        loop {
            match buffer.fill_with(|spare| stream.read(spare)) {
                Ok(0) => return ReadOutcome::EndOfStream,
                Ok(_) => return ReadOutcome::Data,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::WouldBlock;
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    debug!(%error, "read failed, treating as end of stream");
                    return ReadOutcome::EndOfStream;
                }
            }
        }
    }

    fn mark_read_closed(&self) -> Result<(), CoreError> {
        let mut socket = self.socket.lock();
        socket.read_closed = true;
        self.sync(&mut socket)
    }
}

impl Channel for TcpConnection {
    fn write(&self, buffer: &mut Buffer) -> Result<(), CoreError> {
        let mut socket = self.socket.lock();
        let queue = socket.connecting || !socket.pending.is_empty();
        let Some(stream) = socket.stream.as_mut() else {
            return Err(closed_channel());
        };
        if !queue {
            write_nonblocking(stream, buffer).map_err(|error| map_io_error(WRITE, error))?;
            if buffer.is_empty() {
                return Ok(());
            }
        }
        trace!(queued = buffer.remaining(), "write queued");
        socket.pending.push_back(Buffer::copy_from_slice(buffer.as_slice()));
        buffer.advance(buffer.remaining());
        self.sync(&mut socket)
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), CoreError> {
        let mut socket = self.socket.lock();
        if socket.stream.is_some() {
            return Err(CoreError::invalid_state(
                CONNECT.code,
                "channel is already connected or connecting",
            ));
        }
        let stream = TcpStream::connect(addr).map_err(|error| map_io_error(CONNECT, error))?;
        configure(&stream);
        debug!(%addr, "connect initiated");
        socket.stream = Some(stream);
        socket.connecting = true;
        socket.interest = None;
        self.sync(&mut socket)
    }

    fn close(&self) -> Result<(), CoreError> {
        let mut socket = self.socket.lock();
        let Some(mut stream) = socket.stream.take() else {
            return Ok(());
        };
        if !socket.connecting {
            while let Some(mut front) = socket.pending.pop_front() {
                if write_nonblocking(&mut stream, &mut front).is_err() || !front.is_empty() {
                    break;
                }
            }
        }
        socket.pending.clear();
        if socket.interest.take().is_some()
            && let Err(error) = self
                .event_loop
                .with_registry(|registry| registry.deregister(&mut stream))
        {
            debug!(%error, "deregister on close failed");
        }
        let token = socket.token.take();
        drop(socket);

        if let Some(token) = token {
            self.event_loop.remove(token);
        }
        let _ = stream.shutdown(Shutdown::Both);
        debug!(token = token.map(|t| t.0), "connection closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.lock().stream.is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .stream
            .as_ref()
            .and_then(|stream| stream.local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .stream
            .as_ref()
            .and_then(|stream| stream.peer_addr().ok())
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let socket = self.socket.lock();
        f.debug_struct("TcpConnection")
            .field("open", &socket.stream.is_some())
            .field("connecting", &socket.connecting)
            .field("pending", &socket.pending.len())
            .field("read_closed", &socket.read_closed)
            .finish()
    }
}

/// 注册在事件循环上的一条连接。
pub(crate) struct ConnectionEntry {
    connection: Arc<TcpConnection>,
    pipeline: Pipeline,
    read_capacity: usize,
}

impl ConnectionEntry {
    /// 组装通道与流水线，绑定执行器并安装流控通知，随后加入应用 Handler。
    pub(crate) fn establish(
        event_loop: &EventLoop,
        stream: Option<TcpStream>,
        read_capacity: usize,
        auto_read: bool,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Self>, CoreError> {
        let connection = Arc::new(TcpConnection::new(event_loop.clone(), stream));
        let channel: Arc<dyn Channel> = connection.clone();
        let pipeline = Pipeline::with_auto_read(channel, event_loop.pool().clone(), auto_read);
        pipeline.attach_executor(Arc::new(event_loop.clone()))?;

        let entry = Arc::new(Self {
            connection,
            pipeline,
            read_capacity,
        });
        let weak = Arc::downgrade(&entry);
        entry
            .pipeline
            .flow()
            .install_notifier(move || Self::schedule_read(&weak));
        entry.pipeline.add_last(handler)?;
        Ok(entry)
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn connection(&self) -> &Arc<TcpConnection> {
        &self.connection
    }

    /// 流控状态变化后，在下一轮循环里补做一次读取。
    fn schedule_read(weak: &Weak<Self>) {
        let Some(entry) = weak.upgrade() else {
            return;
        };
        if !entry.pipeline.flow().should_read() {
            return;
        }
        let task_entry = Arc::clone(&entry);
        let scheduled = entry.connection.event_loop.execute(move || {
            crate::event_loop::guard(task_entry.as_ref(), || task_entry.read());
        });
        if let Err(error) = scheduled {
            debug!(code = error.code(), "read resume not scheduled");
        }
    }

    /// 连接完成：先刷出排队写入，再通知流水线。
    fn complete_connect(&self) -> Result<(), CoreError> {
        if !self.connection.finish_connect()? {
            return Ok(());
        }
        debug!(
            pipeline = self.pipeline.id(),
            peer = ?self.connection.peer_addr(),
            "connection established"
        );
        self.connection.flush_pending()?;
        self.pipeline.fire_connected()
    }

    /// 读到 `WouldBlock` 为止；自动读在回调中被关闭时提前停止。
    fn read(&self) -> Result<(), CoreError> {
        let flow = self.pipeline.flow();
        let required = flow.take_required();
        if !flow.auto_read() && !required {
            return Ok(());
        }
        loop {
            let mut buffer = self.pipeline.allocate(self.read_capacity);
            match self.connection.read_into(&mut buffer) {
                ReadOutcome::Data => {
                    trace!(pipeline = self.pipeline.id(), bytes = buffer.remaining(), "read");
                    self.pipeline.fire_receive(buffer)?;
                    if !flow.auto_read() && !required {
                        return Ok(());
                    }
                }
                ReadOutcome::WouldBlock | ReadOutcome::Closed => {
                    self.pipeline.free(buffer);
                    return Ok(());
                }
                ReadOutcome::EndOfStream => {
                    self.pipeline.free(buffer);
                    return self.end_of_stream();
                }
            }
        }
    }

    fn end_of_stream(&self) -> Result<(), CoreError> {
        debug!(pipeline = self.pipeline.id(), "peer closed read side");
        self.connection.mark_read_closed()?;
        self.pipeline.fire_receive(Buffer::end_of_stream())?;
        self.pipeline.fire_read_terminated()
    }
}

impl Registration for ConnectionEntry {
    fn kind(&self) -> SourceKind {
        SourceKind::Stream
    }

    fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.connection.bind_token(registry, token)
    }

    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        self.connection.unbind(registry)
    }

    fn ready(&self, readiness: Readiness) -> Result<(), CoreError> {
        if self.connection.is_connecting() {
            if readiness.writable || readiness.error || readiness.write_closed {
                self.complete_connect()?;
            }
            if self.connection.is_connecting() {
                return Ok(());
            }
        }
        if readiness.readable || readiness.read_closed || readiness.error {
            self.read()?;
        }
        if readiness.writable {
            self.connection.flush_pending()?;
        }
        Ok(())
    }

    fn fault(&self, error: CoreError) {
        self.pipeline.fire_error(error);
    }

    fn shutdown(&self) {
        if let Err(error) = self.pipeline.close() {
            warn!(pipeline = self.pipeline.id(), %error, "pipeline close failed");
        }
        if let Err(error) = self.connection.close() {
            warn!(pipeline = self.pipeline.id(), %error, "channel close failed");
        }
    }
}

/// 写到缓冲耗尽或套接字返回 `WouldBlock`。
fn write_nonblocking(stream: &mut TcpStream, buffer: &mut Buffer) -> io::Result<()> {
    while !buffer.is_empty() {
        match stream.write(buffer.as_slice()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => buffer.advance(written),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

fn configure(stream: &TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "TCP_NODELAY not applied");
    }
    if let Err(error) = SockRef::from(stream).set_keepalive(true) {
        debug!(%error, "SO_KEEPALIVE not applied");
    }
}
