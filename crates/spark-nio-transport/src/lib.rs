#![doc = r#"
# spark-nio-transport

## 定位（Why）
- 以 mio 驱动的单线程事件循环承载任意多条非阻塞 TCP 连接；
- 把套接字就绪事件翻译为 `spark-nio-core` 流水线事件，应用只需编写 Handler。

## 结构（How）
- [`EventLoop`]：注册表、跨线程任务队列、分派边界与多路复用器重建；
- [`TcpServer`] / [`TcpClient`]：入站监听与出站连接，两者共用同一套连接适配器；
- [`ConnectionHandle`]：应用线程操作连接的句柄，操作被投递到循环线程执行；
- [`EventLoopConfig`] / [`ConnectionConfig`]：参数与 TOML 反序列化。

## 契约（What）
- 同一连接的全部回调在其事件循环线程上串行执行；
- 回调返回的错误与 panic 在分派边界转为该连接的错误事件，循环线程不受影响；
- 未显式指定循环时使用共享默认循环（[`default_event_loop`]），它拒绝关闭。
"#]

mod client;
mod config;
mod connection;
mod error;
mod event_loop;
mod handle;
mod server;
mod shared;

pub use client::TcpClient;
pub use config::{
    ConnectionConfig, ConnectionOptions, DEFAULT_READ_BUFFER_CAPACITY, EventLoopConfig,
};
pub use connection::TcpConnection;
pub use event_loop::{EventLoop, LoopStatus, Readiness, Registration, SourceKind};
pub use mio;
pub use handle::ConnectionHandle;
pub use server::TcpServer;
pub use shared::default_event_loop;
