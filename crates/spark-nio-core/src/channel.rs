use std::net::SocketAddr;

use spark_nio_buffer::Buffer;

use crate::error::CoreError;

/// 头哨兵眼中的底层通道。
///
/// # 契约（What）
/// - 所有方法只在所属事件循环线程上被流水线调用，实现仍需 `Send + Sync`
///   以便流水线句柄跨线程移动；
/// - `write` 从 `buffer` 的读游标处消费字节：能立即写出的直接写出，其余字节由实现自行排队，
///   返回后缓冲由头哨兵归还给池；
/// - `connect` 发起非阻塞连接，完成通知以 `connected` 事件的形式从头部送入流水线；
/// - `close` 可重复调用。
pub trait Channel: Send + Sync + 'static {
    fn write(&self, buffer: &mut Buffer) -> Result<(), CoreError>;

    fn connect(&self, addr: SocketAddr) -> Result<(), CoreError>;

    fn close(&self) -> Result<(), CoreError>;

    fn is_open(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
