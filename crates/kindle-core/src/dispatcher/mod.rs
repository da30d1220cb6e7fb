//! 协作式单线程调度器。
//!
//! # 设计定位（Why）
//! - 所有连接与观察者回调都在同一个调度线程上串行执行，任何“等待”都表达为“现在返回，稍后回调”；
//! - 唯一的真实并发点是推入端：中断或辅助线程可以随时 [`EventDispatcher::schedule`]，
//!   因此队列采用 CAS 推入 + 单消费者弹出的定长环；
//! - 弱绑定调度（[`EventDispatcher::schedule_weak`]）让“稍后通知观察者”在目标已销毁时被静默丢弃，
//!   而不是访问悬垂对象。
//!
//! # 契约（What）
//! - 同一调度器上的动作严格按推入顺序执行（FIFO）；
//! - 容量在构造时固定，超出容量视为配置错误并 `panic!`；
//! - 消费端只能有一个：在动作内部再次调用 [`EventDispatcher::execute_all_actions`] 会 `panic!`。
//!
//! # 扩展点（How）
//! - [`ExecutionWaker::request_execution`] 在每次推入后调用，用于唤醒平台阻塞等待；
//! - [`IdleStrategy::idle`] 在队列排空后调用，执行平台阻塞等待（`poll`、事件标志等）。

mod ring;
#[cfg(feature = "std")]
mod parker;

use alloc::sync::{Arc, Weak};

use crate::config::DispatcherConfig;
use crate::sync::{AtomicBool, Ordering};

pub use ring::Action;
#[cfg(feature = "std")]
pub use parker::ThreadParker;

use ring::ActionRing;

/// 推入后唤醒调度线程的扩展点。
///
/// 实现者会被任意线程调用，必须是非阻塞的。
pub trait ExecutionWaker: Send + Sync {
    /// 请求调度线程尽快醒来执行队列中的动作。
    fn request_execution(&self);
}

/// 队列排空后的阻塞等待策略。
pub trait IdleStrategy {
    /// 阻塞直至有新动作或平台事件。实现可以在等待期间向 `dispatcher` 推入新动作。
    fn idle(&mut self, dispatcher: &EventDispatcher);
}

/// 不做任何等待的空策略，适用于测试中的忙轮询。
#[derive(Clone, Copy, Debug, Default)]
pub struct SpinIdle;

impl IdleStrategy for SpinIdle {
    fn idle(&mut self, _dispatcher: &EventDispatcher) {
        core::hint::spin_loop();
    }
}

struct DispatcherInner {
    ring: ActionRing,
    waker: Option<Arc<dyn ExecutionWaker>>,
    consuming: AtomicBool,
}

/// 调度器句柄，克隆代价为一次引用计数递增。
///
/// # 示例
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use kindle_core::config::DispatcherConfig;
/// use kindle_core::dispatcher::EventDispatcher;
///
/// let dispatcher = EventDispatcher::new(DispatcherConfig::default());
/// let trace = Arc::new(Mutex::new(Vec::new()));
/// for step in 0..3 {
///     let trace = Arc::clone(&trace);
///     dispatcher.schedule(move || trace.lock().unwrap().push(step));
/// }
/// dispatcher.execute_all_actions();
/// assert_eq!(*trace.lock().unwrap(), vec![0, 1, 2]);
/// ```
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl core::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("capacity", &self.capacity())
            .field("min_free_capacity", &self.min_free_capacity())
            .finish()
    }
}

impl EventDispatcher {
    /// 构造不带唤醒器的调度器；`capacity` 为零时 `panic!`。
    pub fn new(config: DispatcherConfig) -> Self {
        Self::build(config, None)
    }

    /// 构造带唤醒器的调度器，每次推入后调用 `waker.request_execution()`。
    pub fn with_waker(config: DispatcherConfig, waker: Arc<dyn ExecutionWaker>) -> Self {
        Self::build(config, Some(waker))
    }

    fn build(config: DispatcherConfig, waker: Option<Arc<dyn ExecutionWaker>>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                ring: ActionRing::new(config.capacity()),
                waker,
                consuming: AtomicBool::new(false),
            }),
        }
    }

    /// 推入一个动作。可在任意线程调用；队列已满时 `panic!`。
    pub fn schedule(&self, action: impl FnOnce() + Send + 'static) {
        self.inner.ring.push(alloc::boxed::Box::new(action));
        if let Some(waker) = &self.inner.waker {
            waker.request_execution();
        }
    }

    /// 推入一个弱绑定到 `target` 的动作：执行时若目标已释放则静默跳过。
    pub fn schedule_weak<T>(&self, target: &Arc<T>, action: impl FnOnce(Arc<T>) + Send + 'static)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.schedule_bound(Arc::downgrade(target), action);
    }

    /// 与 [`schedule_weak`](Self::schedule_weak) 相同，但直接接受弱引用。
    pub fn schedule_bound<T>(&self, target: Weak<T>, action: impl FnOnce(Arc<T>) + Send + 'static)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.schedule(move || {
            if let Some(target) = target.upgrade() {
                action(target);
            }
        });
    }

    /// 执行队首动作，返回是否执行了动作。
    pub fn execute_first_action(&self) -> bool {
        let _consumer = ConsumerGuard::enter(&self.inner.consuming);
        self.pop_and_run()
    }

    /// 排空队列，包括执行过程中新推入的动作。
    pub fn execute_all_actions(&self) {
        let _consumer = ConsumerGuard::enter(&self.inner.consuming);
        while self.pop_and_run() {}
    }

    fn pop_and_run(&self) -> bool {
        match self.inner.ring.pop() {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// 队列是否为空。
    pub fn is_idle(&self) -> bool {
        self.inner.ring.is_empty()
    }

    /// 构造时设定的容量。
    pub fn capacity(&self) -> usize {
        self.inner.ring.capacity()
    }

    /// 运行以来观察到的最小空闲槽位数，用于容量规划。
    pub fn min_free_capacity(&self) -> usize {
        self.inner.ring.min_free()
    }

    /// 永久运行：排空队列，然后进入 `idle`。
    pub fn run(&self, idle: &mut dyn IdleStrategy) -> ! {
        loop {
            self.execute_all_actions();
            idle.idle(self);
        }
    }

    /// 在 `condition` 为真时持续运行；每轮排空后检查一次条件。
    pub fn run_while(&self, idle: &mut dyn IdleStrategy, mut condition: impl FnMut() -> bool) {
        loop {
            self.execute_all_actions();
            if !condition() {
                break;
            }
            idle.idle(self);
        }
    }
}

/// 消费端独占标记，防止在动作内部重入排空逻辑。
struct ConsumerGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ConsumerGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let entered = flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        assert!(entered, "event dispatcher drained re-entrantly or from two consumers");
        Self { flag }
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
