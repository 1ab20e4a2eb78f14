use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CoreError, codes};
use crate::handler::{Handler, Interests};

use super::NodeId;

pub(crate) const HEAD: usize = 0;
pub(crate) const TAIL: usize = 1;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    /// 头 → 尾。
    Inbound,
    /// 尾 → 头。
    Outbound,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Position {
    Before,
    After,
}

/// 节点标识连同其槽位的租约；租约存活期间槽位不会被复用。
#[derive(Clone)]
pub(crate) struct Lease {
    pub(crate) node: NodeId,
    pin: Arc<()>,
}

impl Lease {
    /// 槽位在复用后，旧节点的租约不再指向它。
    fn pins(&self, slot: &Slot) -> bool {
        Arc::ptr_eq(&self.pin, &slot.pin)
    }
}

struct Slot {
    serial: u64,
    handler: Option<Arc<dyn Handler>>,
    interests: Interests,
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
    pin: Arc<()>,
}

impl Slot {
    fn new(
        handler: Arc<dyn Handler>,
        interests: Interests,
        prev: Option<usize>,
        next: Option<usize>,
    ) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            handler: Some(handler),
            interests,
            prev,
            next,
            linked: true,
            pin: Arc::new(()),
        }
    }

    fn leased(&self) -> bool {
        Arc::strong_count(&self.pin) > 1
    }
}

/// 以下标代替指针的双向链表。
///
/// # 教案式注释
///
/// ## 逻辑（How）
/// - 下标 0 是头哨兵，1 是尾哨兵；
/// - 移除或替换时只重连邻居，被移除的槽位保留自己原有的 `prev/next`，
///   正在该节点上执行的回调继续转发时会沿这条旧链接进入剩余链路；
/// - 被移除的槽位 `linked == false` 且不再持有 Handler，查找时被跳过，
///   因此它不会再收到任何后续事件；
/// - 每个 [`Context`](super::Context) 持有所在槽位的 [`Lease`]。被移除的槽位先进入 `retired`，
///   只有当 `retired` 中没有任何槽位仍被租用时才整体转入 `free`，新节点优先复用 `free` 中的槽位，
///   并换上新的序号与租约。
///
/// ## 契约（What）
/// - 头尾哨兵恒在；用户节点严格位于两者之间；
/// - 仍被租用的已移除槽位，以及从它的旧链接可能走到的已移除槽位，都不会被复用；
/// - 长期持有已移除节点的上下文会让本流水线的槽位回到只增不减；
/// - 所有方法都在流水线锁内执行，且从不调用 Handler 回调（`interests` 在加锁前读取）。
pub(crate) struct Arena {
    slots: Vec<Slot>,
    retired: Vec<usize>,
    free: Vec<usize>,
}

impl Arena {
    pub(crate) fn new(head: Arc<dyn Handler>, tail: Arc<dyn Handler>) -> Self {
        Self {
            slots: vec![
                Slot::new(head, Interests::ALL, None, Some(TAIL)),
                Slot::new(tail, Interests::ALL, Some(HEAD), None),
            ],
            retired: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn node(&self, index: usize) -> NodeId {
        NodeId {
            index,
            serial: self.slots[index].serial,
        }
    }

    pub(crate) fn lease(&self, index: usize) -> Lease {
        Lease {
            node: self.node(index),
            pin: Arc::clone(&self.slots[index].pin),
        }
    }

    /// 节点仍在链上；槽位被复用后，旧标识一律视为已移除。
    pub(crate) fn is_linked(&self, node: NodeId) -> bool {
        self.slots
            .get(node.index)
            .is_some_and(|slot| slot.linked && slot.serial == node.serial)
    }

    /// 自 `from` 起沿 `direction` 查找第一个关心 `event` 的在链节点。
    pub(crate) fn find(
        &self,
        from: &Lease,
        direction: Direction,
        event: Interests,
    ) -> Option<(Lease, Arc<dyn Handler>)> {
        if !from.pins(&self.slots[from.node.index]) {
            return None;
        }
        let mut cursor = self.step(from.node.index, direction);
        while let Some(index) = cursor {
            let slot = &self.slots[index];
            if slot.linked
                && slot.interests.contains(event)
                && let Some(handler) = &slot.handler
            {
                return Some((self.lease(index), Arc::clone(handler)));
            }
            cursor = self.step(index, direction);
        }
        None
    }

    pub(crate) fn insert(
        &mut self,
        anchor: NodeId,
        position: Position,
        handler: Arc<dyn Handler>,
        interests: Interests,
    ) -> Result<Lease, CoreError> {
        self.ensure_linked(anchor)?;
        let anchor = anchor.index;
        let (prev, next) = match position {
            Position::Before if anchor == HEAD => return Err(sentinel_error()),
            Position::After if anchor == TAIL => return Err(sentinel_error()),
            Position::Before => (self.slots[anchor].prev, Some(anchor)),
            Position::After => (Some(anchor), self.slots[anchor].next),
        };
        Ok(self.link(prev, next, handler, interests))
    }

    /// 摘除节点，返回其 Handler 以便调用方在锁外释放。
    pub(crate) fn remove(&mut self, node: NodeId) -> Result<Option<Arc<dyn Handler>>, CoreError> {
        self.ensure_mutable(node)?;
        let index = node.index;
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        if let Some(prev) = prev {
            self.slots[prev].next = next;
        }
        if let Some(next) = next {
            self.slots[next].prev = prev;
        }
        Ok(self.retire(index))
    }

    /// 在原位置放入新 Handler 并摘除旧节点。
    pub(crate) fn replace(
        &mut self,
        node: NodeId,
        handler: Arc<dyn Handler>,
        interests: Interests,
    ) -> Result<(Lease, Option<Arc<dyn Handler>>), CoreError> {
        self.ensure_mutable(node)?;
        let index = node.index;
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        let node = self.link(prev, next, handler, interests);
        Ok((node, self.retire(index)))
    }

    /// 按链路顺序列出用户节点。
    pub(crate) fn user_nodes(&self) -> Vec<(Lease, Arc<dyn Handler>)> {
        let mut nodes = Vec::new();
        let mut cursor = self.slots[HEAD].next;
        while let Some(index) = cursor {
            if index == TAIL {
                break;
            }
            if let Some(handler) = &self.slots[index].handler {
                nodes.push((self.lease(index), Arc::clone(handler)));
            }
            cursor = self.slots[index].next;
        }
        nodes
    }

    fn step(&self, index: usize, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Inbound => self.slots[index].next,
            Direction::Outbound => self.slots[index].prev,
        }
    }

    fn link(
        &mut self,
        prev: Option<usize>,
        next: Option<usize>,
        handler: Arc<dyn Handler>,
        interests: Interests,
    ) -> Lease {
        let slot = Slot::new(handler, interests, prev, next);
        let index = match self.vacant() {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        if let Some(prev) = prev {
            self.slots[prev].next = Some(index);
        }
        if let Some(next) = next {
            self.slots[next].prev = Some(index);
        }
        self.lease(index)
    }

    /// 取一个可复用的槽位；`free` 耗尽时，仅在没有已移除槽位被租用时回收 `retired`。
    fn vacant(&mut self) -> Option<usize> {
        if self.free.is_empty()
            && !self.retired.is_empty()
            && self.retired.iter().all(|&index| !self.slots[index].leased())
        {
            self.free.append(&mut self.retired);
        }
        self.free.pop()
    }

    fn retire(&mut self, index: usize) -> Option<Arc<dyn Handler>> {
        let slot = &mut self.slots[index];
        slot.linked = false;
        slot.interests = Interests::NONE;
        self.retired.push(index);
        slot.handler.take()
    }

    fn ensure_linked(&self, node: NodeId) -> Result<(), CoreError> {
        if self.is_linked(node) {
            Ok(())
        } else {
            Err(CoreError::invalid_state(
                codes::PIPELINE_NODE_REMOVED,
                "node has already been removed from the pipeline",
            ))
        }
    }

    fn ensure_mutable(&self, node: NodeId) -> Result<(), CoreError> {
        if node.index == HEAD || node.index == TAIL {
            return Err(sentinel_error());
        }
        self.ensure_linked(node)
    }
}

fn sentinel_error() -> CoreError {
    CoreError::invalid_state(
        codes::PIPELINE_SENTINEL,
        "pipeline head and tail sentinels cannot be moved, removed or replaced",
    )
}
