use std::io;

use spark_nio_core::{CoreError, codes};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.nio.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.nio.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: codes::CHANNEL_CONNECT,
    message: "tcp connect",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.nio.tcp.resolve_failed",
    message: "tcp resolve",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::CHANNEL_WRITE,
    message: "tcp write",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: codes::EVENT_LOOP_REGISTER,
    message: "event loop register",
};
pub(crate) const START: OperationKind = OperationKind {
    code: codes::EVENT_LOOP_START,
    message: "event loop start",
};

/// 将 IO 错误映射为框架级 [`CoreError`]，保留原始错误作为 `source()`。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    CoreError::io(kind.code, kind.message, error)
}

pub(crate) fn not_running(status: impl std::fmt::Debug) -> CoreError {
    CoreError::invalid_state(
        codes::EVENT_LOOP_NOT_RUNNING,
        format!("event loop is not running (status {status:?})"),
    )
}

pub(crate) fn closed_channel() -> CoreError {
    CoreError::invalid_state(codes::CHANNEL_CLOSED, "channel is already closed")
}

pub(crate) fn invalid_config(message: &'static str) -> CoreError {
    CoreError::invalid_state(codes::CONFIG_INVALID, message)
}
