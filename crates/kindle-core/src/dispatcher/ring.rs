//! 定长无锁动作环。
//!
//! # 逻辑（How）
//! - 推入端：CAS 循环递增 `push` 索引占位，占位成功后把动作写入槽位，最后以 `Release` 置位占用标志；
//! - 弹出端：单消费者以 `Acquire` 读取占用标志，标志未置位即视为队列为空（包括“已占位但尚未写完”的槽位），
//!   取出动作后清除标志，再推进 `pop` 索引；
//! - 任何时刻 `push - pop` 不超过容量；超过即视为静态容量规划失误，直接 `panic!`。

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::sync::{AtomicBool, AtomicUsize, Ordering, SlotLock};

/// 调度动作的装箱形式。
pub type Action = Box<dyn FnOnce() + Send + 'static>;

struct Slot {
    occupied: AtomicBool,
    action: SlotLock<Option<Action>>,
}

pub(crate) struct ActionRing {
    slots: Box<[Slot]>,
    push: AtomicUsize,
    pop: AtomicUsize,
    min_free: AtomicUsize,
}

impl ActionRing {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event dispatcher capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| Slot {
                occupied: AtomicBool::new(false),
                action: SlotLock::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            push: AtomicUsize::new(0),
            pop: AtomicUsize::new(0),
            min_free: AtomicUsize::new(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn min_free(&self) -> usize {
        self.min_free.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.push.load(Ordering::Acquire) == self.pop.load(Ordering::Acquire)
    }

    /// 多生产者安全的推入。
    pub(crate) fn push(&self, action: Action) {
        let capacity = self.capacity();
        let mut index = self.push.load(Ordering::Acquire);
        let used = loop {
            let pop = self.pop.load(Ordering::Acquire);
            let used = index.wrapping_sub(pop);
            assert!(
                used < capacity,
                "event dispatcher overflow: all {capacity} action slots are in use"
            );
            match self.push.compare_exchange_weak(
                index,
                index.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break used + 1,
                Err(actual) => index = actual,
            }
        };
        self.record_free(capacity - used);

        let slot = &self.slots[index % capacity];
        slot.action.with(|stored| *stored = Some(action));
        slot.occupied.store(true, Ordering::Release);
    }

    /// 单消费者弹出；返回 `None` 表示队首暂不可用。
    pub(crate) fn pop(&self) -> Option<Action> {
        let index = self.pop.load(Ordering::Relaxed);
        let slot = &self.slots[index % self.capacity()];
        if !slot.occupied.load(Ordering::Acquire) {
            return None;
        }
        let action = slot.action.with(Option::take);
        slot.occupied.store(false, Ordering::Release);
        self.pop.store(index.wrapping_add(1), Ordering::Release);
        action
    }

    fn record_free(&self, free: usize) {
        let mut current = self.min_free.load(Ordering::Relaxed);
        while free < current {
            match self.min_free.compare_exchange_weak(
                current,
                free,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}
