//! 原子与锁的统一出口。
//!
//! 常规构建使用 `core` 原子与 `spin::Mutex`；`cfg(loom)` 下切换到 loom 的模型类型，
//! 让环形队列的推入/弹出交错可以被穷举验证。
//! 传输后端共用的 [`lock`] 只在 `std` 下提供。

#[cfg(not(any(loom, kindle_loom)))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(any(loom, kindle_loom))]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 仅供槽位使用的互斥封装，屏蔽 `spin` 与 loom 在 `lock()` 返回值上的差异。
pub(crate) struct SlotLock<T> {
    #[cfg(not(any(loom, kindle_loom)))]
    inner: spin::Mutex<T>,
    #[cfg(any(loom, kindle_loom))]
    inner: loom::sync::Mutex<T>,
}

impl<T> SlotLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            #[cfg(not(any(loom, kindle_loom)))]
            inner: spin::Mutex::new(value),
            #[cfg(any(loom, kindle_loom))]
            inner: loom::sync::Mutex::new(value),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        #[cfg(not(any(loom, kindle_loom)))]
        {
            let mut guard = self.inner.lock();
            f(&mut guard)
        }
        #[cfg(any(loom, kindle_loom))]
        {
            let mut guard = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        }
    }
}

/// 获取 `std` 互斥锁；持锁线程 panic 导致的中毒不影响后端继续运转，直接取回内部状态。
#[cfg(feature = "std")]
pub fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(all(test, feature = "std", not(any(loom, kindle_loom))))]
mod tests {
    use super::lock;
    use std::sync::{Arc, Mutex};

    #[test]
    fn poisoned_mutex_still_yields_its_state() {
        let shared = Arc::new(Mutex::new(7));
        let poisoner = Arc::clone(&shared);
        let outcome = std::thread::spawn(move || {
            let _guard = poisoner.lock().expect("首次加锁");
            panic!("持锁线程崩溃");
        })
        .join();
        assert!(outcome.is_err());
        assert!(shared.is_poisoned());
        assert_eq!(*lock(&shared), 7);
    }
}
