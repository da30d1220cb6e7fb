//! 连接契约：`Connection`（主体）与 `ConnectionObserver`（观察者）。
//!
//! # 设计定位（Why）
//! - 所有传输后端（套接字、回环替身）与装饰器（TLS）都以完全一致的方式实现这对接口，
//!   上层协议只面对“请求发送流 → 回调交付 → 释放即发送”与“数据到达 → 拉取读者 → 确认”两组交互；
//! - 观察者只持有连接的弱句柄 [`Subject`]，连接的存活期由后端注册表显式掌管；
//!   连接持有观察者的强引用，拆除时释放，从而避免引用环。
//!
//! # 契约（What）
//! - 一条连接同一时刻最多挂接一个观察者，一个观察者最多观察一条连接；
//! - 所有观察者回调都经由调度器投递，连接绝不在持有自身锁时回调观察者；
//! - 非观察者发起的拆除先投递 [`ConnectionObserver::closing_connection`]（携带 [`DisconnectReason`]），
//!   随后投递 [`ConnectionObserver::detached`]；观察者自己发起的关闭/中止只投递 `detached`。
//!
//! # 风险（Trade-offs）
//! - 违背单一未完成流约束属于编程错误，由 [`StreamGate`](crate::stream::StreamGate) 直接 `panic!`，不提供恢复路径。

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::net::SocketAddr;

use spin::Mutex;

use crate::dispatcher::EventDispatcher;
use crate::error::DisconnectReason;
use crate::stream::{ReceiveStream, SendStream};

/// 双向字节流端点。
pub trait Connection: Send + Sync + 'static {
    /// 请求一个恰好 `size` 字节的发送流，稍后经 `send_stream_available` 交付。
    ///
    /// 前置条件：没有未交付或未释放的发送流，且 `size <= max_send_stream_size()`；违背即 `panic!`。
    fn request_send_stream(&self, size: usize);

    /// 单次发送请求的上限。
    fn max_send_stream_size(&self) -> usize;

    /// 同步返回覆盖全部未确认入站字节的读者。
    ///
    /// 前置条件：此前返回的读者已经释放；违背即 `panic!`。
    fn receive_stream(&self) -> ReceiveStream;

    /// 确认最近一个读者实际读过的字节，释放对应的接收窗口。
    fn ack_received(&self);

    /// 优雅关闭：尽量冲刷待发数据并发送 FIN/`close_notify`，随后拆除。
    fn close_and_destroy(&self);

    /// 立即拆除，不做优雅关闭。重复调用是无操作。
    fn abort_and_destroy(&self);

    /// 挂接观察者；已有观察者时 `panic!`。
    fn attach(&self, observer: Arc<dyn ConnectionObserver>);

    /// 当前是否挂接了观察者。
    fn is_attached(&self) -> bool;

    /// 本地地址（若有）。
    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    /// 对端地址（若有）。
    fn peer_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// 连接的非拥有句柄，交给观察者用于回调主体。
#[derive(Clone)]
pub struct Subject {
    connection: Weak<dyn Connection>,
}

impl Subject {
    pub fn new(connection: Weak<dyn Connection>) -> Self {
        Self { connection }
    }

    /// 升级为强引用；连接已被拆除时返回 `None`。
    pub fn get(&self) -> Option<Arc<dyn Connection>> {
        self.connection.upgrade()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("alive", &(self.connection.strong_count() > 0))
            .finish()
    }
}

/// 观察者内嵌的主体槽位，提供内部可变性。
#[derive(Default)]
pub struct SubjectSlot {
    subject: Mutex<Option<Subject>>,
}

impl SubjectSlot {
    pub const fn new() -> Self {
        Self {
            subject: Mutex::new(None),
        }
    }

    pub fn set(&self, subject: Subject) {
        *self.subject.lock() = Some(subject);
    }

    pub fn clear(&self) {
        *self.subject.lock() = None;
    }

    /// 当前主体（若仍然存活）。
    pub fn get(&self) -> Option<Arc<dyn Connection>> {
        let subject = self.subject.lock().clone();
        subject.and_then(|subject| subject.get())
    }

    pub fn is_attached(&self) -> bool {
        self.subject.lock().is_some()
    }
}

impl fmt::Debug for SubjectSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// 连接事件的接收方。
///
/// 所有回调都在调度线程上执行；实现通过内部可变性保存状态。
pub trait ConnectionObserver: Send + Sync + 'static {
    /// 保存主体句柄的槽位。
    fn subject_slot(&self) -> &SubjectSlot;

    /// 挂接完成，随后才可能收到其它回调。
    fn attached(&self, subject: Subject) {
        self.subject_slot().set(subject);
    }

    /// 传输完全建立（TLS 在握手完成后）时触发一次。
    fn connected(&self) {}

    /// 交付此前请求的发送流；写入不超过请求大小后释放即发送。
    fn send_stream_available(&self, stream: SendStream);

    /// 有新的入站字节可读。
    fn data_received(&self);

    /// 传输被带外拆除（对端关闭、错误、握手失败）；此后不得再发起流请求。
    fn closing_connection(&self, reason: DisconnectReason) {
        let _ = reason;
    }

    /// 与主体解除挂接，此后不会再收到任何回调。
    fn detached(&self) {
        self.subject_slot().clear();
    }

    /// 观察者发起的优雅关闭。
    fn close(&self) {
        if let Some(subject) = self.subject() {
            subject.close_and_destroy();
        }
    }

    /// 观察者发起的中止。
    fn abort(&self) {
        if let Some(subject) = self.subject() {
            subject.abort_and_destroy();
        }
    }

    /// 当前主体。
    fn subject(&self) -> Option<Arc<dyn Connection>> {
        self.subject_slot().get()
    }
}

/// 连接生命周期。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// 可正常收发。
    Established,
    /// 已请求优雅关闭，正在冲刷待发数据。
    Closing,
    /// 已拆除。
    Detached,
}

impl LinkState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, Self::Detached)
    }
}

/// 在调度器上投递拆除通知：可选的 `closing_connection(reason)`，随后 `detached()`。
///
/// 观察者被强引用捕获进动作，因此连接本身可以立即从注册表移除。
pub fn notify_teardown(
    dispatcher: &EventDispatcher,
    observer: Arc<dyn ConnectionObserver>,
    reason: Option<DisconnectReason>,
) {
    dispatcher.schedule(move || {
        if let Some(reason) = reason {
            observer.closing_connection(reason);
        }
        observer.detached();
    });
}
