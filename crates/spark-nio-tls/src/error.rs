use std::borrow::Cow;
use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use spark_nio_core::{CoreError, ErrorKind};

/// TLS 稳定错误码。
pub mod codes {
    /// 握手失败（协议不兼容、握手未完成即收到数据等）。
    pub const HANDSHAKE: &str = "spark.nio.tls.handshake_failed";
    /// 对端证书被拒绝。
    pub const CERTIFICATE: &str = "spark.nio.tls.certificate_rejected";
    /// 收到致命告警。
    pub const ALERT: &str = "spark.nio.tls.alert_received";
    /// 记录解码或解密失败。
    pub const DECODE: &str = "spark.nio.tls.decode_failed";
    /// 对端未发送 close_notify 即关闭。
    pub const UNEXPECTED_CLOSE: &str = "spark.nio.tls.unexpected_close";
    /// 引擎内部读写失败。
    pub const ENGINE: &str = "spark.nio.tls.engine_failed";
    /// 非法的服务器名称。
    pub const SERVER_NAME: &str = "spark.nio.tls.invalid_server_name";
    /// 缓冲尺寸增长超过上限。
    pub const BUFFER_LIMIT: &str = "spark.nio.tls.buffer_limit";
    /// 引擎拒收应用数据。
    pub const DATA_REJECTED: &str = "spark.nio.tls.data_rejected";
}

/// 将 `rustls` 错误映射为带稳定错误码的 [`CoreError`]。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 流水线上的错误处理只看 [`ErrorKind`] 与错误码，不应依赖具体 TLS 库的枚举；
/// - 证书类、告警类与完整性类错误分开编码，便于运维按码聚合。
///
/// ## 契约（What）
/// - 返回值的 `kind()` 恒为 [`ErrorKind::Tls`]，原始 `rustls::Error` 作为 `source()` 保留；
/// - 未识别的变体归入 `HANDSHAKE`。
pub(crate) fn map_rustls_error(operation: &str, error: RustlsError) -> CoreError {
    let code = code_for(&error);
    CoreError::new(
        ErrorKind::Tls,
        code,
        Cow::Owned(format!("{operation}: {error}")),
    )
    .with_cause(error)
}

/// 引擎内部 I/O（读写内存缓冲）失败。
pub(crate) fn map_engine_io(operation: &str, error: io::Error) -> CoreError {
    let code = match error.kind() {
        io::ErrorKind::UnexpectedEof => codes::UNEXPECTED_CLOSE,
        io::ErrorKind::InvalidData => codes::DECODE,
        _ => codes::ENGINE,
    };
    CoreError::new(ErrorKind::Tls, code, format!("{operation}: {error}")).with_cause(error)
}

pub(crate) fn tls_error(code: &'static str, message: impl Into<Cow<'static, str>>) -> CoreError {
    CoreError::new(ErrorKind::Tls, code, message)
}

fn code_for(error: &RustlsError) -> &'static str {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => codes::DECODE,
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => {
            codes::CERTIFICATE
        }
        AlertReceived(alert) => alert_code(alert),
        PeerIncompatible(_) | HandshakeNotComplete | NoApplicationProtocol => codes::HANDSHAKE,
        General(_) => codes::ENGINE,
        _ => codes::HANDSHAKE,
    }
}

fn alert_code(alert: &AlertDescription) -> &'static str {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateRequired => codes::CERTIFICATE,
        CloseNotify | UserCanceled => codes::UNEXPECTED_CLOSE,
        DecodeError | DecryptError | BadRecordMac | RecordOverflow => codes::DECODE,
        _ => codes::ALERT,
    }
}
