use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::fmt;

use spin::Mutex;

use crate::dispatcher::EventDispatcher;

/// 等待队列中的登记标识，用于显式取消。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

type RetryFn = Box<dyn FnOnce(PoolPermit) -> Option<PoolPermit> + Send + 'static>;

struct Waiter {
    id: WaiterId,
    retry: RetryFn,
}

struct PoolState {
    in_use: usize,
    min_available: usize,
    next_waiter: u64,
    waiting: VecDeque<Waiter>,
}

struct PoolInner {
    capacity: usize,
    dispatcher: EventDispatcher,
    state: Mutex<PoolState>,
}

/// 后端实例内所有连接共享的发送块池。
///
/// # 意图（Why）
/// - 发送块总数固定，任何时刻未归还的块不超过容量；
/// - 耗尽时不报错，而是把连接登记到等待队列，槽位归还后按登记顺序转交。
///
/// # 逻辑（How）
/// - [`try_acquire`](Self::try_acquire) 成功返回 RAII 的 [`PoolPermit`]，释放时归还槽位；
///   队列非空时直接拒绝，新来的请求排在已等待者之后；
/// - 归还时若有等待者，槽位不回到空闲计数，而是包装成新的凭证，在下一轮调度中交给最早的等待者；
///   闭包退回凭证表示等待者已不再需要（连接已拆除），凭证随即释放并转交下一位。
///
/// # 契约（What）
/// - 只在调度线程上调用；内部的自旋锁仅保护短临界区，永远不会在持锁时回调外部代码。
#[derive(Clone)]
pub struct SendBufferPool {
    inner: Arc<PoolInner>,
}

impl SendBufferPool {
    pub fn new(capacity: usize, dispatcher: EventDispatcher) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                dispatcher,
                state: Mutex::new(PoolState {
                    in_use: 0,
                    min_available: capacity,
                    next_waiter: 0,
                    waiting: VecDeque::new(),
                }),
            }),
        }
    }

    /// 非阻塞申请一个槽位。
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        let mut state = self.inner.state.lock();
        if state.in_use >= self.inner.capacity || !state.waiting.is_empty() {
            return None;
        }
        state.in_use += 1;
        let available = self.inner.capacity - state.in_use;
        state.min_available = state.min_available.min(available);
        Some(PoolPermit {
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// 登记等待；轮到本等待者时 `retry` 带着转交的凭证在调度线程上执行一次。
    ///
    /// 闭包收下凭证返回 `None`，用不上则原样返回，槽位继续转交。
    pub fn wait(
        &self,
        retry: impl FnOnce(PoolPermit) -> Option<PoolPermit> + Send + 'static,
    ) -> WaiterId {
        let mut state = self.inner.state.lock();
        let id = WaiterId(state.next_waiter);
        state.next_waiter = state.next_waiter.wrapping_add(1);
        state.waiting.push_back(Waiter {
            id,
            retry: Box::new(retry),
        });
        id
    }

    /// 取消登记，返回是否找到。
    pub fn cancel(&self, id: WaiterId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.waiting.len();
        state.waiting.retain(|waiter| waiter.id != id);
        before != state.waiting.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    pub fn available(&self) -> usize {
        self.inner.capacity - self.in_use()
    }

    /// 运行以来的最小可用槽位数。
    pub fn min_available(&self) -> usize {
        self.inner.state.lock().min_available
    }

    /// 等待队列长度。
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }
}

impl fmt::Debug for SendBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SendBufferPool")
            .field("capacity", &self.inner.capacity)
            .field("in_use", &state.in_use)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl PoolInner {
    fn release(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            let next = state.waiting.pop_front();
            if next.is_none() {
                state.in_use = state.in_use.saturating_sub(1);
            }
            next
        };
        if let Some(waiter) = next {
            self.hand_over(waiter);
        }
    }

    /// 槽位仍计入 `in_use`，凭证在调度中转交，期间任何 `try_acquire` 都抢不到它。
    fn hand_over(self: &Arc<Self>, waiter: Waiter) {
        let permit = PoolPermit {
            pool: Arc::downgrade(self),
        };
        self.dispatcher.schedule(move || {
            // 退回的凭证在此释放，转交给下一位。
            drop((waiter.retry)(permit));
        });
    }
}

/// 发送池槽位的所有权凭证，`Drop` 时归还。
pub struct PoolPermit {
    pool: Weak<PoolInner>,
}

impl fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PoolPermit")
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release();
        }
    }
}
