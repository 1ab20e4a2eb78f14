use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};

/// 缓冲内部表示。
///
/// - `Writable`：由池或分配器提供的可写存储；
/// - `ReadOnly`：包裹共享只读字节，无法被通用地清空，因此绕开池化；
/// - `EndOfStream`：半关闭哨兵，仅以变体而非长度区分。
enum Repr {
    Writable(BytesMut),
    ReadOnly(Bytes),
    EndOfStream,
}

/// 单次 I/O 与流水线事件之间传递的独占缓冲。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 为事件循环、流水线与 TLS 适配器提供统一的字节载体：读取线程把网络数据写入缓冲，
///   Handler 从读游标处消费，头哨兵写完后交还给池；
/// - 所有权即“令牌”：`BufferPool::free` 以值接收缓冲，同一实例不可能被归还两次。
///
/// ## 逻辑（How）
/// - 可写缓冲持有 `BytesMut`，其长度表示已写入字节，`position` 为读游标；
/// - 逻辑容量 `capacity` 固定为分配时的请求值，写入永远不会越过该上限，
///   从而保证“同一容量桶里的缓冲可互换”；
/// - 只读缓冲与半关闭哨兵不可写，`spare_capacity` 恒为 0。
///
/// ## 契约（What）
/// - 新分配的缓冲满足 `position() == 0` 且 `spare_capacity() == capacity()`；
/// - `as_slice` 始终返回 `[position, len)` 区间内未读字节；
/// - `advance` 超出未读长度时截断到末尾，不会 panic。
pub struct Buffer {
    repr: Repr,
    pos: usize,
    capacity: usize,
}

impl Buffer {
    /// 以新鲜堆内存创建指定容量的可写缓冲，不经过任何池。
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_storage(BytesMut::with_capacity(capacity), capacity)
    }

    /// 以复制的方式构造一个写满 `data` 的可写缓冲，多用于测试与一次性消息。
    pub fn copy_from_slice(data: &[u8]) -> Self {
        let mut buffer = Self::with_capacity(data.len());
        buffer.put_slice(data);
        buffer
    }

    /// 包装共享只读字节。
    pub fn read_only(bytes: Bytes) -> Self {
        let capacity = bytes.len();
        Self {
            repr: Repr::ReadOnly(bytes),
            pos: 0,
            capacity,
        }
    }

    /// 构造半关闭哨兵：零长度、只读，并且与任何真实的空读取可区分。
    pub const fn end_of_stream() -> Self {
        Self {
            repr: Repr::EndOfStream,
            pos: 0,
            capacity: 0,
        }
    }

    pub(crate) fn from_storage(mut storage: BytesMut, capacity: usize) -> Self {
        storage.clear();
        if storage.capacity() < capacity {
            storage.reserve(capacity);
        }
        Self {
            repr: Repr::Writable(storage),
            pos: 0,
            capacity,
        }
    }

    /// 拆出可写存储；只读缓冲与哨兵原样返回 `Err`。
    pub(crate) fn into_storage(self) -> Result<(BytesMut, usize), Buffer> {
        match self.repr {
            Repr::Writable(storage) => Ok((storage, self.capacity)),
            repr => Err(Buffer {
                repr,
                pos: self.pos,
                capacity: self.capacity,
            }),
        }
    }

    /// 逻辑容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 读游标位置。
    pub fn position(&self) -> usize {
        self.pos
    }

    /// 已写入（含已读）字节数。
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Writable(storage) => storage.len(),
            Repr::ReadOnly(bytes) => bytes.len(),
            Repr::EndOfStream => 0,
        }
    }

    /// 尚未被读取的字节数。
    pub fn remaining(&self) -> usize {
        self.len() - self.pos
    }

    /// 是否没有未读字节。
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// 还能写入的字节数。
    pub fn spare_capacity(&self) -> usize {
        match &self.repr {
            Repr::Writable(storage) => self.capacity - storage.len(),
            _ => 0,
        }
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self.repr, Repr::Writable(_))
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.repr, Repr::EndOfStream)
    }

    /// 追加写入，返回实际写入的字节数（受剩余容量限制，只读缓冲写入 0）。
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.spare_capacity());
        if let Repr::Writable(storage) = &mut self.repr {
            storage.extend_from_slice(&src[..count]);
        }
        count
    }

    /// 让调用方直接向剩余容量写入，例如套接字 `read`。
    ///
    /// 闭包收到长度为 `spare_capacity()` 的切片并返回写入的字节数；
    /// 出错时缓冲内容保持不变。
    pub fn fill_with<F>(&mut self, fill: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let spare = self.spare_capacity();
        let Repr::Writable(storage) = &mut self.repr else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "read-only buffer cannot be filled",
            ));
        };
        let start = storage.len();
        storage.resize(start + spare, 0);
        match fill(&mut storage[start..]) {
            Ok(written) => {
                let written = written.min(spare);
                storage.truncate(start + written);
                Ok(written)
            }
            Err(err) => {
                storage.truncate(start);
                Err(err)
            }
        }
    }

    /// 未读字节视图。
    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Writable(storage) => &storage[self.pos..],
            Repr::ReadOnly(bytes) => &bytes[self.pos..],
            Repr::EndOfStream => &[],
        }
    }

    /// 前移读游标。
    pub fn advance(&mut self, count: usize) {
        self.pos = (self.pos + count).min(self.len());
    }

    /// 清空内容并重置读游标；只读缓冲保持原样。
    pub fn clear(&mut self) {
        if let Repr::Writable(storage) = &mut self.repr {
            storage.clear();
            self.pos = 0;
        }
    }

    /// 复制未读字节。
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// 冻结为共享只读字节，仅保留未读部分。
    pub fn freeze(self) -> Bytes {
        let pos = self.pos;
        match self.repr {
            Repr::Writable(storage) => storage.freeze().slice(pos..),
            Repr::ReadOnly(bytes) => bytes.slice(pos..),
            Repr::EndOfStream => Bytes::new(),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.repr {
            Repr::Writable(_) => "writable",
            Repr::ReadOnly(_) => "read_only",
            Repr::EndOfStream => "end_of_stream",
        };
        f.debug_struct("Buffer")
            .field("kind", &kind)
            .field("position", &self.pos)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
