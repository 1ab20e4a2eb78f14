//! 随运行时提供的通用 Handler。

mod io_error;
mod logging;

pub use io_error::IoErrorHandler;
pub use logging::LoggingHandler;
