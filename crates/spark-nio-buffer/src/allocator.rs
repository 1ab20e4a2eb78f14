use bytes::BytesMut;

use crate::buffer::Buffer;

/// 底层分配器：池未命中时由它提供新存储，淘汰或拒收的缓冲交还给它。
///
/// # 契约（What）
/// - `allocate(capacity)` 返回的存储至少具备 `capacity` 字节容量，长度为 0；
/// - `release` 接收任意形态的缓冲（包括只读与半关闭哨兵），实现可以直接丢弃；
/// - 实现必须满足 `Send + Sync`，因为淘汰线程与事件循环线程都会调用它。
pub trait BufferAllocator: Send + Sync + 'static {
    fn allocate(&self, capacity: usize) -> BytesMut;

    fn release(&self, buffer: Buffer) {
        drop(buffer);
    }
}

/// 默认堆分配器，释放即交还全局分配器。
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }
}

/// 将请求尺寸向上取整到 1 KiB 块粒度。
///
/// TLS 适配器与连接读取都用它把“建议尺寸”落到有限的几个容量桶上，提高池命中率。
pub const fn size_for(size: usize) -> usize {
    const BLOCK: usize = 1024;
    if size == 0 {
        return BLOCK;
    }
    size.div_ceil(BLOCK) * BLOCK
}
