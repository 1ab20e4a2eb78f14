//! 头尾哨兵的默认行为：写出后归还缓冲、错误兜底关闭、读终止只关闭一次。

mod support;

use std::sync::Arc;

use spark_nio_core::{Buffer, CoreError, Handler};
use support::{Journal, Recorder, bytes, pipeline};
use tracing_test::traced_test;

#[test]
fn read_terminated_closes_pipeline_once() {
    let (pipeline, channel) = pipeline();
    let journal = Journal::default();
    pipeline.add_last(Recorder::new("A", &journal)).expect("添加 A 失败");

    pipeline
        .fire_receive(Buffer::end_of_stream())
        .expect("半关闭哨兵分派失败");
    pipeline.fire_read_terminated().expect("读终止分派失败");
    pipeline.fire_read_terminated().expect("重复读终止分派失败");
    pipeline.close().expect("显式关闭失败");

    assert_eq!(journal.count("A:receive:<eos>"), 1);
    assert_eq!(journal.count("A:close"), 1, "关闭只应向链路发出一次");
    assert_eq!(channel.closes(), 1);
    assert!(pipeline.is_closed());
}

#[test]
fn head_frees_written_buffer_even_on_failure() {
    let (pipeline, channel) = pipeline();
    let mut buffer = pipeline.allocate(1024);
    buffer.put_slice(b"payload");
    channel.fail_writes();

    let err = pipeline.write(buffer).expect_err("通道写失败应向上返回");
    assert!(err.is_io());
    assert_eq!(pipeline.pool().pooled(1024), 1, "失败的写也必须归还缓冲");
}

#[test]
fn tail_returns_unconsumed_buffers_to_pool() {
    let (pipeline, _channel) = pipeline();
    let mut buffer = pipeline.allocate(2048);
    buffer.put_slice(b"ignored");
    pipeline.fire_receive(buffer).expect("入站分派失败");
    assert_eq!(pipeline.pool().pooled(2048), 1);
}

#[traced_test]
#[test]
fn head_logs_unhandled_errors() {
    let (pipeline, channel) = pipeline();
    pipeline.fire_error(CoreError::protocol("test.protocol", "unexpected frame"));
    assert!(logs_contain("unhandled pipeline error"));
    assert_eq!(channel.closes(), 1);
}

#[test]
fn sentinel_outbound_close_through_context() {
    struct CloseOnReceive;
    impl Handler for CloseOnReceive {
        fn on_receive(
            &self,
            ctx: &spark_nio_core::Context,
            buffer: Buffer,
        ) -> Result<(), CoreError> {
            ctx.free(buffer);
            ctx.close()
        }
    }

    let (pipeline, channel) = pipeline();
    pipeline.add_last(Arc::new(CloseOnReceive)).expect("添加节点失败");
    pipeline.fire_receive(bytes("bye")).expect("分派失败");
    assert_eq!(channel.closes(), 1);
    assert!(pipeline.is_closed());

    pipeline.close().expect("关闭应为幂等");
    assert_eq!(channel.closes(), 1);
}
