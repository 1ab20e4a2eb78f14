//! 端到端场景：真实回环套接字上的明文、TLS、半关闭与流控。

mod support;

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_nio_core::Handler;
use spark_nio_tls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use spark_nio_tls::{TlsHandler, server_name};
use spark_nio_transport::{TcpClient, TcpServer};
use support::{Install, Recorder, loopback, shutdown, started_loop, wait_until};

#[test]
fn plaintext_ping_is_echoed() -> anyhow::Result<()> {
    let event_loop = started_loop("scenario-plain");
    let server_side = Recorder::echo();
    let server = TcpServer::bind(loopback(server_side.clone(), &event_loop))
        .context("绑定回环监听失败")?;

    let client_side = Recorder::new();
    let handle = TcpClient::connect(
        loopback(client_side.clone(), &event_loop).with_port(server.local_addr().port()),
    )
    .context("发起连接失败")?;
    handle.write(&b"PING"[..]).context("投递写入失败")?;

    wait_until("客户端收到回显", || client_side.received() == b"PING");
    assert_eq!(server_side.received(), b"PING");
    assert_eq!(client_side.connected(), 1);
    assert_eq!(server_side.connected(), 1);
    assert!(client_side.errors().is_empty());

    server.close();
    shutdown(&event_loop);
    Ok(())
}

#[test]
fn tls_delivers_plaintext_only_after_handshake() -> anyhow::Result<()> {
    let event_loop = started_loop("scenario-tls");
    let (server_config, client_config) = tls_configs();

    let server_side = Recorder::echo();
    let server_app = server_side.clone();
    let server_chain = Install::new(move || {
        vec![
            Arc::new(TlsHandler::server(Arc::clone(&server_config))) as Arc<dyn Handler>,
            server_app.clone() as Arc<dyn Handler>,
        ]
    });
    let server =
        TcpServer::bind(loopback(server_chain, &event_loop)).context("绑定 TLS 监听失败")?;

    let client_side = Recorder::new();
    let client_app = client_side.clone();
    let name = server_name("localhost").context("主机名不合法")?;
    let client_chain = Install::new(move || {
        vec![
            Arc::new(TlsHandler::client(Arc::clone(&client_config), name.clone()))
                as Arc<dyn Handler>,
            client_app.clone() as Arc<dyn Handler>,
        ]
    });
    let handle = TcpClient::connect(
        loopback(client_chain, &event_loop).with_port(server.local_addr().port()),
    )
    .context("发起 TLS 连接失败")?;
    // 握手完成前写入，适配器负责排队。
    handle
        .write(&b"hello over tls"[..])
        .context("投递写入失败")?;

    wait_until("客户端收到 TLS 回显", || {
        client_side.received() == b"hello over tls"
    });
    assert_eq!(client_side.connected(), 1);
    assert_eq!(server_side.connected(), 1);
    assert!(!server_side.data_before_connected(), "握手完成前不应交付明文");
    assert!(!client_side.data_before_connected(), "握手完成前不应交付明文");
    assert_eq!(handle.pipeline().names(), vec!["tls", "recorder"]);

    server.close();
    shutdown(&event_loop);
    Ok(())
}

#[test]
fn server_close_reaches_client_once() {
    let event_loop = started_loop("scenario-close");
    let server_side = Recorder::greet_and_close(b"bye");
    let server = TcpServer::bind(loopback(server_side.clone(), &event_loop)).expect("监听失败");

    let client_side = Recorder::new();
    let handle = TcpClient::connect(
        loopback(client_side.clone(), &event_loop).with_port(server.local_addr().port()),
    )
    .expect("发起连接失败");

    wait_until("客户端关闭", || client_side.closes() == 1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(client_side.received(), b"bye");
    assert_eq!(client_side.end_of_stream(), 1);
    assert_eq!(client_side.closes(), 1);
    assert!(handle.is_closed());
    assert!(!handle.is_open());

    server.close();
    shutdown(&event_loop);
}

#[test]
fn disabled_auto_read_holds_data_until_enabled() {
    let event_loop = started_loop("scenario-flow");
    let server_side = Recorder::new();
    let server = TcpServer::bind(
        loopback(server_side.clone(), &event_loop).with_auto_read(false),
    )
    .expect("监听失败");

    let client_side = Recorder::new();
    let handle = TcpClient::connect(
        loopback(client_side.clone(), &event_loop).with_port(server.local_addr().port()),
    )
    .expect("发起连接失败");
    handle.write(&b"DATA"[..]).expect("投递写入失败");

    wait_until("服务端连接建立", || server_side.pipeline().is_some());
    thread::sleep(Duration::from_millis(200));
    assert!(server_side.received().is_empty(), "自动读关闭时不应交付数据");

    let pipeline = server_side.pipeline().expect("已记录流水线");
    pipeline.flow().set_auto_read(true);
    wait_until("恢复自动读后收到数据", || server_side.received() == b"DATA");

    server.close();
    shutdown(&event_loop);
}

#[test]
fn one_shot_read_request_delivers_pending_bytes() {
    let event_loop = started_loop("scenario-request-read");
    let server_side = Recorder::new();
    let server = TcpServer::bind(
        loopback(server_side.clone(), &event_loop).with_auto_read(false),
    )
    .expect("监听失败");

    let client_side = Recorder::new();
    let handle = TcpClient::connect(
        loopback(client_side.clone(), &event_loop).with_port(server.local_addr().port()),
    )
    .expect("发起连接失败");
    handle.write(&b"ONCE"[..]).expect("投递写入失败");

    wait_until("服务端连接建立", || server_side.pipeline().is_some());
    thread::sleep(Duration::from_millis(100));
    let pipeline = server_side.pipeline().expect("已记录流水线");
    pipeline.flow().request_read();
    wait_until("一次性读请求交付数据", || server_side.received() == b"ONCE");
    assert!(!pipeline.flow().auto_read());

    server.close();
    shutdown(&event_loop);
}

#[test]
fn refused_connect_surfaces_as_pipeline_error() {
    let event_loop = started_loop("scenario-refused");
    // 绑定后立即关闭，得到一个大概率无人监听的端口。
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("临时监听失败");
        listener.local_addr().expect("本地地址").port()
    };

    let client_side = Recorder::new();
    match TcpClient::connect(loopback(client_side.clone(), &event_loop).with_port(port)) {
        Err(error) => assert_eq!(error.code(), spark_nio_core::codes::CHANNEL_CONNECT),
        Ok(handle) => {
            wait_until("连接失败被报告", || !client_side.errors().is_empty());
            assert_eq!(
                client_side.errors(),
                vec![spark_nio_core::codes::CHANNEL_CONNECT]
            );
            assert_eq!(client_side.connected(), 0);
            wait_until("失败的连接被关闭", || !handle.is_open());
        }
    }

    shutdown(&event_loop);
}

fn tls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    static CONFIGS: OnceLock<(Arc<ServerConfig>, Arc<ClientConfig>)> = OnceLock::new();
    CONFIGS
        .get_or_init(|| {
            let _ = spark_nio_tls::rustls::crypto::ring::default_provider().install_default();
            let CertifiedKey { cert, key_pair } =
                generate_simple_self_signed(vec!["localhost".to_owned()])
                    .expect("生成自签名证书失败");
            let cert_der: CertificateDer<'static> = cert.der().clone();
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
            let server = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der.clone()], key)
                .expect("构造 ServerConfig 失败");
            let mut roots = RootCertStore::empty();
            roots.add(cert_der).expect("加入信任根失败");
            let client = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            (Arc::new(server), Arc::new(client))
        })
        .clone()
}
