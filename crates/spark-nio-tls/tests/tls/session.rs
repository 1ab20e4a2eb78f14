//! 基于 `rustls` 引擎的端到端会话：两条内存流水线互相搬运密文。
//!
//! # 教案级说明
//! - **意图（Why）**：验证握手只通知一次 `connected`、跨记录边界的明文完整送达，
//!   以及握手前排队的写入与 `connected` 回调内的重入写入都按顺序到达对端；
//! - **结构（How）**：`Wire` 通道把密文留在队列里，`pump`/`converge` 以可配置的分片大小
//!   投递给对端，模拟任意 TCP 分段。

mod support;

use proptest::prelude::*;
use spark_nio_core::ErrorKind;
use spark_nio_tls::codes;
use support::{Inbox, connect, converge, payload, pump};

#[test]
fn handshake_reports_connected_exactly_once() {
    let (client, server) = connect(Inbox::default().into(), Inbox::echo());
    assert_eq!(client.inbox.connected(), 0, "握手完成前不得通知 connected");

    converge(&client, &server, 4096);
    assert_eq!(client.inbox.connected(), 1);
    assert_eq!(server.inbox.connected(), 1);

    client.write(b"x");
    converge(&client, &server, 4096);
    assert_eq!(server.inbox.received(), b"x");
    assert_eq!(client.inbox.received(), b"x", "服务端应回显");
    assert_eq!(client.inbox.connected(), 1);
    assert_eq!(server.inbox.connected(), 1);
}

#[test]
fn payloads_spanning_several_records_round_trip() {
    let (client, server) = connect(Inbox::default().into(), Inbox::echo());
    converge(&client, &server, 4096);

    for len in [16 * 1024, 16 * 1024 + 1, 100_000] {
        let data = payload(len);
        let before = client.inbox.received().len();
        client.write(&data);
        converge(&client, &server, 4096);
        assert_eq!(&client.inbox.received()[before..], &data[..], "长度 {len} 的回显不一致");
    }
}

#[test]
fn writes_issued_before_handshake_are_delivered_in_order() {
    let (client, server) = connect(Inbox::default().into(), Inbox::default().into());
    client.write(b"first ");
    client.write(b"second");
    assert_eq!(server.inbox.received(), b"");

    converge(&client, &server, 4096);
    assert_eq!(server.inbox.received(), b"first second");
}

#[test]
fn write_from_connected_callback_follows_queued_writes() {
    let (client, server) = connect(Inbox::greeting(b"hello"), Inbox::default().into());
    client.write(b"queued;");

    converge(&client, &server, 4096);
    assert_eq!(server.inbox.received(), b"queued;hello");
}

#[test]
fn server_greeting_reaches_client() {
    let (client, server) = connect(Inbox::default().into(), Inbox::greeting(b"220 ready"));
    converge(&client, &server, 4096);
    assert_eq!(client.inbox.received(), b"220 ready");
}

#[test]
fn close_sends_close_notify_and_closes_channel_once() {
    let (client, server) = connect(Inbox::default().into(), Inbox::default().into());
    converge(&client, &server, 4096);

    client.pipeline.close().expect("关闭失败");
    client.pipeline.close().expect("重复关闭应为空操作");
    assert_eq!(client.wire.closes(), 1);

    let moved = pump(&client, &server, 4096);
    assert!(moved > 0, "关闭前应发出 close_notify 告警记录");
    assert!(!server.pipeline.is_closed());
}

#[test]
fn tampered_record_surfaces_tls_error() {
    let (client, server) = connect(Inbox::default().into(), Inbox::default().into());
    converge(&client, &server, 4096);

    client.write(b"integrity matters");
    let mut record = client.wire.drain();
    let last = record.len() - 1;
    record[last] ^= 0x5a;

    let error = server
        .pipeline
        .fire_receive(spark_nio_buffer::Buffer::copy_from_slice(&record))
        .expect_err("被篡改的记录必须被拒绝");
    assert_eq!(error.kind(), ErrorKind::Tls);
    assert_eq!(error.code(), codes::DECODE);
    assert_eq!(server.inbox.received(), b"");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn arbitrary_segmentation_preserves_the_byte_stream(
        len in 1usize..40_000,
        chunk in 1usize..1500,
    ) {
        let (client, server) = connect(Inbox::default().into(), Inbox::echo());
        converge(&client, &server, chunk);
        prop_assert_eq!(client.inbox.connected(), 1);

        let data = payload(len);
        client.write(&data);
        converge(&client, &server, chunk);
        prop_assert_eq!(server.inbox.received(), data.clone());
        prop_assert_eq!(client.inbox.received(), data);
    }
}
