#![doc = r#"
# spark-nio-tls

## 定位（Why）
- 以流水线 Handler 的形式提供 TLS：上游交换密文，下游看到明文与“握手完成才算已连接”的语义；
- 握手、记录加解密与证书信任全部委托给外部引擎能力 [`TlsEngine`]，默认实现 [`RustlsEngine`]
  基于 `rustls`（`ring` 密码学后端）。

## 结构（How）
- `engine`：引擎能力与记录层结果类型；
- `rustls_engine`：`rustls` 连接到 `wrap`/`unwrap` 原语的换算；
- `adapter`：握手驱动与记录分帧状态机 [`TlsAdapter`]；
- `installer`：加入流水线即替换为适配器的 [`TlsHandler`]；
- `error`：`rustls` 错误到稳定错误码的映射。

## 使用（What）
```ignore
pipeline.add_last(Arc::new(TlsHandler::server(server_config)))?;
pipeline.add_last(Arc::new(MyProtocol::default()))?;
```
"#]

mod adapter;
mod engine;
mod error;
mod installer;
mod rustls_engine;

pub use adapter::TlsAdapter;
pub use engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, Role, TlsEngine};
pub use error::codes;
pub use installer::TlsHandler;
pub use rustls_engine::{MAX_PACKET, MAX_PLAINTEXT, RustlsEngine, server_name};

pub use rustls;
