use std::io;

use thiserror::Error;

/// 缓冲池构造阶段可能出现的错误。
#[derive(Debug, Error)]
pub enum PoolError {
    /// 配置项非法，附带字段名。
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),
    /// 后台淘汰线程创建失败。
    #[error("failed to spawn pool sweeper: {0}")]
    Spawn(#[source] io::Error),
}
