use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use spark_nio_core::{CoreError, Handler};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ConnectionOptions};
use crate::connection::ConnectionEntry;
use crate::error::{ACCEPT, BIND, map_io_error};
use crate::event_loop::{self, EventLoop, Readiness, Registration, SourceKind};
use crate::shared::resolve_event_loop;

const LISTEN_BACKLOG: i32 = 1024;

/// 监听 TCP 端口，为每条入站连接建立流水线。
///
/// # 教案式注释
///
/// ## 逻辑（How）
/// - 监听套接字经 `socket2` 打开（`SO_REUSEADDR` + 显式 backlog），再交给 mio 注册读兴趣；
/// - 每次就绪循环 `accept` 到 `WouldBlock`；新连接的流水线使用所属循环的缓冲池，
///   加入配置中的 Handler 后注册，并在循环线程上发出 `connected`；
/// - 多路复用器重建时监听器被迁移到新的多路复用器，已接受的连接则被关闭。
///
/// ## 契约（What）
/// - `close` 只停止接受新连接，已建立的连接不受影响；
/// - 单次 `accept` 失败（例如文件描述符耗尽）只记录日志，监听继续。
pub struct TcpServer {
    acceptor: Arc<Acceptor>,
    local_addr: SocketAddr,
}

struct Acceptor {
    event_loop: EventLoop,
    listener: Mutex<Option<TcpListener>>,
    token: Mutex<Option<Token>>,
    options: ConnectionOptions,
    handler: Arc<dyn Handler>,
}

impl TcpServer {
    pub fn bind(config: ConnectionConfig) -> Result<Self, CoreError> {
        config.options.validate()?;
        let event_loop = resolve_event_loop(config.event_loop.as_ref())?;
        let addr = config.options.resolve()?;
        let listener = open_listener(addr).map_err(|error| map_io_error(BIND, error))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| map_io_error(BIND, error))?;

        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            listener: Mutex::new(Some(listener)),
            token: Mutex::new(None),
            options: config.options,
            handler: config.handler,
        });
        event_loop.register(acceptor.clone())?;
        info!(%local_addr, event_loop = %event_loop.name(), "tcp server listening");
        Ok(Self {
            acceptor,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.acceptor.event_loop
    }

    pub fn is_listening(&self) -> bool {
        self.acceptor.listener.lock().is_some()
    }

    /// 停止监听，可重复调用。
    pub fn close(&self) {
        if self.acceptor.stop() {
            info!(local_addr = %self.local_addr, "tcp server closed");
        }
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl Acceptor {
    fn accept_all(&self) -> Result<(), CoreError> {
        loop {
            let accepted = match self.listener.lock().as_ref() {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    if let Err(error) = self.open(stream) {
                        warn!(%peer, code = error.code(), %error, "failed to set up accepted connection");
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    let error = map_io_error(ACCEPT, error);
                    warn!(code = error.code(), %error, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn open(&self, stream: mio::net::TcpStream) -> Result<(), CoreError> {
        let entry = ConnectionEntry::establish(
            &self.event_loop,
            Some(stream),
            self.options.effective_read_capacity(),
            self.options.auto_read,
            Arc::clone(&self.handler),
        )?;
        self.event_loop.register(entry.clone())?;
        event_loop::guard(entry.as_ref(), || entry.pipeline().fire_connected());
        Ok(())
    }

    fn stop(&self) -> bool {
        let Some(mut listener) = self.listener.lock().take() else {
            return false;
        };
        if let Err(error) = self
            .event_loop
            .with_registry(|registry| registry.deregister(&mut listener))
        {
            debug!(%error, "listener deregister failed");
        }
        if let Some(token) = self.token.lock().take() {
            self.event_loop.remove(token);
        }
        true
    }
}

impl Registration for Acceptor {
    fn kind(&self) -> SourceKind {
        SourceKind::Listener
    }

    fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut listener = self.listener.lock();
        let Some(listener) = listener.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
        };
        registry.register(listener, token, Interest::READABLE)?;
        *self.token.lock() = Some(token);
        Ok(())
    }

    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        match self.listener.lock().as_mut() {
            Some(listener) => registry.deregister(listener),
            None => Ok(()),
        }
    }

    fn ready(&self, readiness: Readiness) -> Result<(), CoreError> {
        if readiness.readable || readiness.error {
            self.accept_all()?;
        }
        Ok(())
    }

    fn fault(&self, error: CoreError) {
        warn!(code = error.code(), %error, "listener fault");
    }

    fn shutdown(&self) {
        self.stop();
    }
}

fn open_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}
