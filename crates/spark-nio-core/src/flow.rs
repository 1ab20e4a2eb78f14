use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

type Notifier = Box<dyn Fn() + Send + Sync + 'static>;

/// 入站流控：自动读开关 + 一次性读请求。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 中继类应用需要在另一侧握手或交接完成前暂停本侧读取；
///   关闭自动读后，连接适配器不再挂载读兴趣，内核缓冲中的数据保持不动。
///
/// ## 逻辑（How）
/// - `auto_read` 与 `required_read` 均为原子布尔，任意线程可修改；
/// - 连接适配器在注册时安装通知回调，状态变化后回调负责唤醒事件循环重新计算兴趣集；
/// - 适配器每次读取前调用 [`take_required`](Self::take_required) 消费一次性请求。
///
/// ## 契约（What）
/// - `should_read() == auto_read || required_read`；
/// - 通知回调至多安装一次，未安装时修改仅在下一次分派后生效。
pub struct FlowControl {
    auto_read: AtomicBool,
    required_read: AtomicBool,
    notifier: OnceLock<Notifier>,
}

impl FlowControl {
    pub fn new(auto_read: bool) -> Self {
        Self {
            auto_read: AtomicBool::new(auto_read),
            required_read: AtomicBool::new(false),
            notifier: OnceLock::new(),
        }
    }

    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    /// 修改自动读开关，状态确有变化时通知连接适配器。
    pub fn set_auto_read(&self, enabled: bool) {
        if self.auto_read.swap(enabled, Ordering::AcqRel) != enabled {
            self.notify();
        }
    }

    /// 请求一次读取，即使自动读关闭。
    pub fn request_read(&self) {
        if !self.required_read.swap(true, Ordering::AcqRel) {
            self.notify();
        }
    }

    pub fn should_read(&self) -> bool {
        self.auto_read() || self.required_read.load(Ordering::Acquire)
    }

    /// 消费一次性读请求。
    pub fn take_required(&self) -> bool {
        self.required_read.swap(false, Ordering::AcqRel)
    }

    /// 安装状态变化通知；重复安装返回 `false`。
    pub fn install_notifier(&self, notifier: impl Fn() + Send + Sync + 'static) -> bool {
        self.notifier.set(Box::new(notifier)).is_ok()
    }

    fn notify(&self) {
        if let Some(notifier) = self.notifier.get() {
            notifier();
        }
    }
}

impl fmt::Debug for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowControl")
            .field("auto_read", &self.auto_read())
            .field("required_read", &self.required_read.load(Ordering::Acquire))
            .finish()
    }
}
