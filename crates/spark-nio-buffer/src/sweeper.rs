use std::io;
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::pool::PoolInner;

/// 启动后台淘汰线程。
///
/// 线程只持有池的弱引用：所有 `BufferPool` 句柄被丢弃后，下一次醒来即退出；
/// 池被关闭且所有桶都已排空时同样退出。
pub(crate) fn spawn(pool: Weak<PoolInner>, interval: Duration) -> io::Result<()> {
    thread::Builder::new()
        .name("spark-nio-pool-sweeper".to_owned())
        .spawn(move || {
            loop {
                thread::sleep(interval);
                let Some(inner) = pool.upgrade() else {
                    trace!("buffer pool dropped, sweeper exiting");
                    break;
                };
                inner.evict_expired(Instant::now());
                if inner.is_closed() && inner.total_pooled() == 0 {
                    debug!("buffer pool closed and drained, sweeper exiting");
                    break;
                }
            }
        })
        .map(|_| ())
}
