//! `spark-nio-buffer` 提供事件循环与流水线共享的缓冲类型及按容量分桶的缓冲池。
//!
//! # 模块定位（Why）
//! - 网络读取、TLS 解包与封包都以固定容量的缓冲为单位流转；
//!   池化同容量缓冲可以在高消息率下摊薄分配成本，并在空闲期通过 TTL 回落到零额外内存。
//! - 作为依赖图的叶子，本 crate 不依赖流水线或事件循环。
//!
//! # 设计概要（How）
//! - [`Buffer`]：独占所有权的字节区域，区分可写、只读与半关闭哨兵三种形态；
//! - [`BufferPool`]：`DashMap` 分桶 + 桶内 `parking_lot::Mutex<VecDeque>` 空闲链表，
//!   最近归还者优先复用，过期条目由后台线程从最旧端淘汰；
//! - [`BufferAllocator`]：池未命中与释放时的底层分配器抽象，默认 [`HeapAllocator`]。
//!
//! # 所有权约定（What）
//! - `allocate` 返回的缓冲在交给 `free` 之前由调用方独占；
//! - `free` 以值接收缓冲，重复归还在类型层面即不可能发生。

mod allocator;
mod buffer;
mod config;
mod error;
mod pool;
mod stats;
mod sweeper;

pub use allocator::{BufferAllocator, HeapAllocator, size_for};
pub use buffer::Buffer;
pub use config::PoolConfig;
pub use error::PoolError;
pub use pool::BufferPool;
pub use stats::PoolStats;
