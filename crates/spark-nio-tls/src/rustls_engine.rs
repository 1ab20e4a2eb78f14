use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use spark_nio_buffer::Buffer;
use spark_nio_core::CoreError;
use tracing::trace;

use crate::engine::{EngineResult, EngineStatus, HandshakeStatus, Role, TlsEngine};
use crate::error::{codes, map_engine_io, map_rustls_error, tls_error};

/// 单个 TLS 记录可承载的最大明文。
pub const MAX_PLAINTEXT: usize = 16 * 1024;
/// 单个 TLS 记录的最大线上尺寸（明文 + 头部 + 填充/MAC 余量）。
pub const MAX_PACKET: usize = MAX_PLAINTEXT + 325;

/// 以 `rustls` 连接状态机实现的 [`TlsEngine`]。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - `rustls` 以“喂入密文、取出明文/密文”的 I/O 风格工作，适配器需要的是
///   `wrap`/`unwrap` 记录层原语；本类型负责两种风格之间的换算。
///
/// ## 逻辑（How）
/// - `wrap`：暂存区为空时，若握手已完成则最多写入一个记录的明文，随后把 `rustls` 待发的全部密文
///   导出到暂存区；暂存区放不进 `dst` 时报告 `BufferOverflow` 且不产出任何字节，
///   下次调用先交付暂存区；
/// - `unwrap`：先交付上次解出但未取走的明文；没有待交付明文时才把 `src` 喂给 `read_tls`
///   （空输入绝不喂入，否则会被当作 EOF）并推进状态机；
/// - 握手完成后第一次操作结果携带 `Finished`，之后报告 `NotHandshaking`；
///   握手完成前仍待发送的尾部记录（客户端 Finished、服务端会话票据）以 `NeedWrap` 体现。
///
/// ## 契约（What）
/// - 信任配置随 `ClientConfig`/`ServerConfig` 传入，本类型不做额外校验；
/// - 不产生委托任务：`rustls` 的证书校验在 `process_new_packets` 内同步完成。
pub struct RustlsEngine {
    conn: Connection,
    role: Role,
    started: bool,
    finished_reported: bool,
    outbound_closed: bool,
    peer_closed: bool,
    staged: Vec<u8>,
    staged_pos: usize,
}

impl RustlsEngine {
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, CoreError> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|error| map_rustls_error("tls client setup", error))?;
        Ok(Self::from_connection(conn.into(), Role::Client))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, CoreError> {
        let conn = ServerConnection::new(config)
            .map_err(|error| map_rustls_error("tls server setup", error))?;
        Ok(Self::from_connection(conn.into(), Role::Server))
    }

    fn from_connection(conn: Connection, role: Role) -> Self {
        Self {
            conn,
            role,
            started: false,
            finished_reported: false,
            outbound_closed: false,
            peer_closed: false,
            staged: Vec::with_capacity(MAX_PACKET),
            staged_pos: 0,
        }
    }

    fn staged(&self) -> &[u8] {
        &self.staged[self.staged_pos..]
    }

    /// 操作结果携带的握手状态：握手刚完成时恰好报告一次 `Finished`。
    fn settle_status(&mut self) -> HandshakeStatus {
        let status = self.handshake_status();
        if status == HandshakeStatus::NotHandshaking && self.started && !self.finished_reported {
            self.finished_reported = true;
            trace!(role = ?self.role, "tls handshake finished");
            return HandshakeStatus::Finished;
        }
        status
    }

    fn stage_outgoing(&mut self) -> Result<(), CoreError> {
        self.staged.clear();
        self.staged_pos = 0;
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut self.staged)
                .map_err(|error| map_engine_io("tls write records", error))?;
        }
        Ok(())
    }

    fn read_plaintext(&mut self, dst: &mut Buffer) -> Result<usize, CoreError> {
        let mut total = 0;
        while dst.spare_capacity() > 0 {
            let conn = &mut self.conn;
            let read = dst.fill_with(|slice| match conn.reader().read(slice) {
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(0),
                other => other,
            });
            match read {
                Ok(0) => break,
                Ok(count) => total += count,
                Err(error) => return Err(map_engine_io("tls read plaintext", error)),
            }
        }
        Ok(total)
    }

    fn result(
        &mut self,
        status: EngineStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> EngineResult {
        EngineResult {
            status,
            handshake_status: self.settle_status(),
            bytes_consumed,
            bytes_produced,
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn begin_handshake(&mut self) -> Result<(), CoreError> {
        self.started = true;
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if !self.started {
            return HandshakeStatus::NotHandshaking;
        }
        let has_output = self.conn.wants_write() || !self.staged().is_empty();
        if self.conn.is_handshaking() {
            if has_output {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.finished_reported && has_output {
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, CoreError> {
        let mut consumed = 0;
        if self.staged().is_empty() {
            if !self.conn.is_handshaking() && !self.outbound_closed && !src.is_empty() {
                let chunk = &src[..src.len().min(MAX_PLAINTEXT)];
                consumed = self
                    .conn
                    .writer()
                    .write(chunk)
                    .map_err(|error| map_engine_io("tls write plaintext", error))?;
            }
            self.stage_outgoing()?;
        }

        let pending = self.staged().len();
        if pending > dst.spare_capacity() {
            return Ok(self.result(EngineStatus::BufferOverflow, consumed, 0));
        }
        dst.put_slice(&self.staged[self.staged_pos..]);
        self.staged.clear();
        self.staged_pos = 0;

        let status = if self.outbound_closed {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(self.result(status, consumed, pending))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, CoreError> {
        if dst.spare_capacity() == 0 {
            return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
        }
        let drained = self.read_plaintext(dst)?;
        if drained > 0 {
            return Ok(self.result(EngineStatus::Ok, 0, drained));
        }
        if self.peer_closed {
            return Ok(self.result(EngineStatus::Closed, 0, 0));
        }
        if src.is_empty() {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }

        let mut reader = src;
        let consumed = self
            .conn
            .read_tls(&mut reader)
            .map_err(|error| map_engine_io("tls read records", error))?;
        let state = self
            .conn
            .process_new_packets()
            .map_err(|error| map_rustls_error("tls process records", error))?;
        if state.peer_has_closed() {
            trace!(role = ?self.role, "peer sent close_notify");
            self.peer_closed = true;
        }
        let produced = self.read_plaintext(dst)?;

        let status = if produced == 0 && self.peer_closed {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(self.result(status, consumed, produced))
    }

    fn application_buffer_size(&self) -> usize {
        MAX_PLAINTEXT
    }

    fn packet_buffer_size(&self) -> usize {
        MAX_PACKET
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn close_inbound(&mut self) {
        self.peer_closed = true;
    }
}

impl fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("role", &self.role)
            .field("handshake_status", &self.handshake_status())
            .field("outbound_closed", &self.outbound_closed)
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}

/// 把主机名解析为 `rustls` 需要的服务器名称。
pub fn server_name(host: &str) -> Result<ServerName<'static>, CoreError> {
    ServerName::try_from(host.to_owned()).map_err(|error| {
        tls_error(codes::SERVER_NAME, format!("invalid tls server name {host:?}")).with_cause(error)
    })
}
