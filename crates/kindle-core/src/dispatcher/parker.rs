use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::{EventDispatcher, ExecutionWaker, IdleStrategy};

/// 宿主环境下的唤醒器与空闲策略：`Mutex<bool>` + `Condvar`。
///
/// # 逻辑（How）
/// - `request_execution` 置位“有活”标志并通知条件变量，可从任意线程调用；
/// - `idle` 等待标志置位（或 `timeout` 到期）后清零返回。
///
/// 同一个实例需要同时作为 [`ExecutionWaker`] 交给调度器、作为 [`IdleStrategy`] 驱动 `run`，
/// 因此通常以 `Arc<ThreadParker>` 共享。
#[derive(Debug)]
pub struct ThreadParker {
    pending: Mutex<bool>,
    signal: Condvar,
    timeout: Option<Duration>,
}

impl ThreadParker {
    /// 无超时的阻塞等待。
    pub fn new() -> Self {
        Self::with_timeout(None)
    }

    /// 带上限的等待；到期即返回，便于上层周期性检查退出条件。
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            pending: Mutex::new(false),
            signal: Condvar::new(),
            timeout,
        }
    }

    fn wait(&self) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*pending {
            match self.timeout {
                Some(timeout) => {
                    let (guard, result) = match self.signal.wait_timeout(pending, timeout) {
                        Ok(outcome) => outcome,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    pending = guard;
                    if result.timed_out() {
                        break;
                    }
                }
                None => {
                    pending = match self.signal.wait(pending) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
        *pending = false;
    }
}

impl Default for ThreadParker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionWaker for ThreadParker {
    fn request_execution(&self) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *pending = true;
        self.signal.notify_one();
    }
}

impl IdleStrategy for &ThreadParker {
    fn idle(&mut self, dispatcher: &EventDispatcher) {
        if dispatcher.is_idle() {
            self.wait();
        }
    }
}
