//! 回调期间的链路变更：移除、替换、插入。
//!
//! # 教案级说明
//! - **契约（What）**：变更只影响之后的分派；正在当前节点上执行的事件照常送达剩余链路，
//!   被移除的节点不再收到任何事件；哨兵节点不可变更。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use spark_nio_core::{Buffer, Context, CoreError, ErrorKind, Handler, codes};
use support::{Journal, Recorder, bytes, pipeline};

/// 第一次收到数据时移除自身，然后把数据继续转发。
struct RemoveOnFirst {
    calls: Arc<AtomicUsize>,
}

impl Handler for RemoveOnFirst {
    fn name(&self) -> &'static str {
        "remove-on-first"
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.remove()?;
        assert!(ctx.is_removed());
        ctx.fire_receive(buffer)
    }
}

/// 收到数据时以 `Recorder` 替换自身，并转发在途数据。
struct SwapOnReceive {
    journal: Journal,
}

impl Handler for SwapOnReceive {
    fn name(&self) -> &'static str {
        "swap"
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        ctx.replace(Recorder::new("S2", &self.journal))?;
        ctx.fire_receive(buffer)
    }
}

/// 加入流水线时立即把自己替换为 `Recorder`。
struct Installer {
    journal: Journal,
}

impl Handler for Installer {
    fn name(&self) -> &'static str {
        "installer"
    }

    fn handler_added(&self, ctx: &Context) -> Result<(), CoreError> {
        ctx.replace(Recorder::new("installed", &self.journal))?;
        Ok(())
    }
}

/// 第一次收到数据时在自身之后插入 `Recorder`。
struct InsertAfter {
    journal: Journal,
    done: AtomicUsize,
}

impl Handler for InsertAfter {
    fn name(&self) -> &'static str {
        "insert-after"
    }

    fn on_receive(&self, ctx: &Context, buffer: Buffer) -> Result<(), CoreError> {
        if self.done.fetch_add(1, Ordering::SeqCst) == 0 {
            ctx.add_after(Recorder::new("C", &self.journal))?;
        }
        ctx.fire_receive(buffer)
    }
}

#[test]
fn removal_during_callback_keeps_in_flight_event() {
    let (pipeline, _channel) = pipeline();
    let journal = Journal::default();
    let calls = Arc::new(AtomicUsize::new(0));
    pipeline
        .add_last(Arc::new(RemoveOnFirst {
            calls: Arc::clone(&calls),
        }))
        .expect("添加节点失败");
    pipeline.add_last(Recorder::new("B", &journal)).expect("添加 B 失败");

    pipeline.fire_receive(bytes("one")).expect("第一次分派失败");
    pipeline.fire_receive(bytes("two")).expect("第二次分派失败");

    assert_eq!(calls.load(Ordering::SeqCst), 1, "被移除节点不应再收到事件");
    assert_eq!(journal.entries(), vec!["B:receive:one", "B:receive:two"]);
    assert_eq!(pipeline.names(), vec!["B"]);
}

#[test]
fn replacement_takes_effect_for_next_event() {
    let (pipeline, _channel) = pipeline();
    let journal = Journal::default();
    pipeline
        .add_last(Arc::new(SwapOnReceive {
            journal: journal.clone(),
        }))
        .expect("添加节点失败");
    pipeline.add_last(Recorder::new("B", &journal)).expect("添加 B 失败");

    pipeline.fire_receive(bytes("one")).expect("第一次分派失败");
    pipeline.fire_receive(bytes("two")).expect("第二次分派失败");

    assert_eq!(
        journal.entries(),
        vec!["B:receive:one", "S2:receive:two", "B:receive:two"]
    );
    assert_eq!(pipeline.names(), vec!["S2", "B"]);
}

#[test]
fn handler_can_replace_itself_when_added() {
    let (pipeline, _channel) = pipeline();
    let journal = Journal::default();
    pipeline
        .add_last(Arc::new(Installer {
            journal: journal.clone(),
        }))
        .expect("添加安装器失败");

    assert_eq!(pipeline.names(), vec!["installed"]);
    pipeline.fire_receive(bytes("x")).expect("分派失败");
    assert_eq!(journal.entries(), vec!["installed:receive:x"]);
}

#[test]
fn inserted_node_sees_following_events_in_order() {
    let (pipeline, _channel) = pipeline();
    let journal = Journal::default();
    pipeline
        .add_last(Arc::new(InsertAfter {
            journal: journal.clone(),
            done: AtomicUsize::new(0),
        }))
        .expect("添加节点失败");
    pipeline.add_last(Recorder::new("B", &journal)).expect("添加 B 失败");

    pipeline.fire_receive(bytes("one")).expect("第一次分派失败");
    pipeline.fire_receive(bytes("two")).expect("第二次分派失败");

    assert_eq!(pipeline.names(), vec!["insert-after", "C", "B"]);
    assert_eq!(journal.count("C:receive:two"), 1);
    assert_eq!(journal.count("B:receive:two"), 1);
}

#[test]
fn removed_node_rejects_further_mutation() {
    let (pipeline, _channel) = pipeline();
    let journal = Journal::default();
    pipeline.add_last(Recorder::new("A", &journal)).expect("添加 A 失败");
    let ctx = pipeline.context_of("A").expect("应能找到节点 A");

    ctx.remove().expect("第一次移除应成功");
    let err = ctx.remove().expect_err("重复移除应失败");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(err.code(), codes::PIPELINE_NODE_REMOVED);

    let err = ctx
        .add_after(Recorder::new("late", &journal))
        .expect_err("已移除节点不可再插入邻居");
    assert_eq!(err.code(), codes::PIPELINE_NODE_REMOVED);
    assert!(pipeline.is_empty());
}

#[test]
fn node_serials_are_monotonic() {
    let (pipeline, _channel) = pipeline();
    let journal = Journal::default();
    let first = pipeline.add_last(Recorder::new("A", &journal)).expect("添加 A 失败");
    let second = pipeline.add_first(Recorder::new("B", &journal)).expect("添加 B 失败");
    assert!(second.serial() > first.serial());
    assert_eq!(pipeline.names(), vec!["B", "A"]);
}
