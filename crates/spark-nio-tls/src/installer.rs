use std::fmt;
use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use spark_nio_core::{Context, CoreError, Handler, Interests};
use tracing::warn;

use crate::adapter::TlsAdapter;
use crate::engine::TlsEngine;
use crate::rustls_engine::{RustlsEngine, server_name};

type EngineFactory = dyn Fn() -> Result<Box<dyn TlsEngine>, CoreError> + Send + Sync;

/// 安装器：加入流水线时为该连接创建引擎，并以 [`TlsAdapter`] 原位替换自身。
///
/// 同一个安装器可以挂到多条流水线上（例如服务端每个连接一份），每次加入都会得到独立的会话。
/// 创建引擎失败时安装器把自己移出流水线并返回错误。
#[derive(Clone)]
pub struct TlsHandler {
    factory: Arc<EngineFactory>,
}

impl TlsHandler {
    /// 客户端会话；`server_name` 用于 SNI 与证书校验。
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self::with_factory(move || {
            let engine = RustlsEngine::client(Arc::clone(&config), server_name.clone())?;
            Ok(Box::new(engine) as Box<dyn TlsEngine>)
        })
    }

    /// 以主机名字符串构造客户端会话。
    pub fn client_for_host(config: Arc<ClientConfig>, host: &str) -> Result<Self, CoreError> {
        Ok(Self::client(config, server_name(host)?))
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::with_factory(move || {
            let engine = RustlsEngine::server(Arc::clone(&config))?;
            Ok(Box::new(engine) as Box<dyn TlsEngine>)
        })
    }

    /// 使用自定义引擎工厂。
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn TlsEngine>, CoreError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl Handler for TlsHandler {
    fn name(&self) -> &'static str {
        "tls-installer"
    }

    fn interests(&self) -> Interests {
        Interests::NONE
    }

    fn handler_added(&self, ctx: &Context) -> Result<(), CoreError> {
        match (self.factory)() {
            Ok(engine) => {
                ctx.replace(Arc::new(TlsAdapter::new(engine)))?;
                Ok(())
            }
            Err(error) => {
                warn!(
                    pipeline = ctx.pipeline().id(),
                    code = error.code(),
                    %error,
                    "tls engine creation failed"
                );
                if let Err(removal) = ctx.remove() {
                    warn!(pipeline = ctx.pipeline().id(), %removal, "failed to remove tls installer");
                }
                Err(error)
            }
        }
    }
}

impl fmt::Debug for TlsHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandler").finish_non_exhaustive()
    }
}
