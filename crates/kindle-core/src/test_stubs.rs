//! 测试桩：记录型观察者与工厂。
//!
//! # 设计定位（Why）
//! - 契约测试、回环测试与各传输后端的集成测试都需要“把回调按顺序记下来”的观察者；
//!   集中在此处维护，接口演进时只需单点修改；
//! - 桩对象同样满足 `no_std + alloc`，可以在最小化环境中复用。
//!
//! # 使用方式（How）
//! - [`RecordingObserver::send`] 排队一段负载并请求发送流，交付后自动写入并释放；
//!   没有排队负载时交付的发送流会被保留，测试可用 [`RecordingObserver::take_held_stream`] 取出后再释放；
//! - `auto_read` 模式下，`data_received` 会立即读取全部数据并 `ack_received`。
//!
//! # 风险（Trade-offs）
//! - 桩对象只做记录，不校验协议语义；需要断言时请检查 [`RecordingObserver::events`]。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::SocketAddr;

use spin::Mutex;

use crate::connection::{ConnectionObserver, Subject, SubjectSlot};
use crate::error::DisconnectReason;
use crate::factory::{
    ClientConnectionObserverFactory, ConnectFailReason, CreateObserver,
    ServerConnectionObserverFactory,
};
use crate::stream::SendStream;

/// 观察者收到的事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverEvent {
    Attached,
    Connected,
    SendStreamAvailable { size: usize },
    DataReceived,
    Closing(DisconnectReason),
    Detached,
}

#[derive(Default)]
struct Recording {
    events: Vec<ObserverEvent>,
    received: Vec<u8>,
    outbox: VecDeque<Vec<u8>>,
    requesting: bool,
    held: Option<SendStream>,
}

/// 记录所有回调的观察者。
pub struct RecordingObserver {
    slot: SubjectSlot,
    auto_read: bool,
    recording: Mutex<Recording>,
}

impl RecordingObserver {
    /// 收到数据后立即读取并确认。
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// 只记录 `data_received`，由测试自行拉取读者。
    pub fn passive() -> Arc<Self> {
        Self::build(false)
    }

    fn build(auto_read: bool) -> Arc<Self> {
        Arc::new(Self {
            slot: SubjectSlot::new(),
            auto_read,
            recording: Mutex::new(Recording::default()),
        })
    }

    /// 排队一段负载并在空闲时请求发送流。
    pub fn send(&self, payload: &[u8]) {
        self.recording.lock().outbox.push_back(payload.to_vec());
        self.request_next();
    }

    fn request_next(&self) {
        let size = {
            let mut recording = self.recording.lock();
            if recording.requesting {
                return;
            }
            let Some(size) = recording.outbox.front().map(Vec::len) else {
                return;
            };
            recording.requesting = true;
            size
        };
        match self.subject() {
            Some(subject) => subject.request_send_stream(size),
            None => self.recording.lock().requesting = false,
        }
    }

    /// 取出被保留的发送流。
    pub fn take_held_stream(&self) -> Option<SendStream> {
        self.recording.lock().held.take()
    }

    /// 是否持有未释放的发送流。
    pub fn holds_stream(&self) -> bool {
        self.recording.lock().held.is_some()
    }

    /// 事件序列快照。
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.recording.lock().events.clone()
    }

    /// 自动读取模式下累计收到的字节。
    pub fn received(&self) -> Vec<u8> {
        self.recording.lock().received.clone()
    }

    pub fn count(&self, event: ObserverEvent) -> usize {
        self.recording
            .lock()
            .events
            .iter()
            .filter(|recorded| **recorded == event)
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.count(ObserverEvent::Connected) > 0
    }

    pub fn is_detached(&self) -> bool {
        self.count(ObserverEvent::Detached) > 0
    }

    /// 最近一次 `closing_connection` 的原因。
    pub fn closing_reason(&self) -> Option<DisconnectReason> {
        self.recording
            .lock()
            .events
            .iter()
            .rev()
            .find_map(|event| match event {
                ObserverEvent::Closing(reason) => Some(*reason),
                _ => None,
            })
    }

    fn record(&self, event: ObserverEvent) {
        self.recording.lock().events.push(event);
    }
}

impl ConnectionObserver for RecordingObserver {
    fn subject_slot(&self) -> &SubjectSlot {
        &self.slot
    }

    fn attached(&self, subject: Subject) {
        self.slot.set(subject);
        self.record(ObserverEvent::Attached);
    }

    fn connected(&self) {
        self.record(ObserverEvent::Connected);
        self.request_next();
    }

    fn send_stream_available(&self, mut stream: SendStream) {
        let payload = {
            let mut recording = self.recording.lock();
            recording.events.push(ObserverEvent::SendStreamAvailable {
                size: stream.limit(),
            });
            recording.requesting = false;
            recording.outbox.pop_front()
        };
        match payload {
            Some(payload) => {
                let written = stream.insert_partial(&payload);
                debug_assert_eq!(written, payload.len());
                drop(stream);
                self.request_next();
            }
            None => self.recording.lock().held = Some(stream),
        }
    }

    fn data_received(&self) {
        self.record(ObserverEvent::DataReceived);
        if !self.auto_read {
            return;
        }
        let Some(subject) = self.subject() else {
            return;
        };
        let mut reader = subject.receive_stream();
        let chunk = reader.extract_contiguous(usize::MAX).to_vec();
        drop(reader);
        subject.ack_received();
        self.recording.lock().received.extend_from_slice(&chunk);
    }

    fn closing_connection(&self, reason: DisconnectReason) {
        self.record(ObserverEvent::Closing(reason));
    }

    fn detached(&self) {
        self.slot.clear();
        let held = {
            let mut recording = self.recording.lock();
            recording.events.push(ObserverEvent::Detached);
            recording.held.take()
        };
        drop(held);
    }
}

/// 为每条接受的连接挂接一个新的 [`RecordingObserver`]。
#[derive(Default)]
pub struct RecordingServerFactory {
    accepted: Mutex<Vec<(SocketAddr, Arc<RecordingObserver>)>>,
    decline: bool,
}

impl RecordingServerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 拒绝所有连接的工厂。
    pub fn declining() -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(Vec::new()),
            decline: true,
        })
    }

    /// 已挂接的观察者。
    pub fn observers(&self) -> Vec<Arc<RecordingObserver>> {
        self.accepted
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.lock().len()
    }
}

impl ServerConnectionObserverFactory for RecordingServerFactory {
    fn connection_accepted(&self, create_observer: CreateObserver, peer: SocketAddr) {
        if self.decline {
            create_observer.decline();
            return;
        }
        let observer = RecordingObserver::new();
        self.accepted.lock().push((peer, Arc::clone(&observer)));
        create_observer.attach(observer);
    }
}

/// 连接到固定地址并挂接给定观察者的客户端工厂。
pub struct RecordingClientFactory {
    address: SocketAddr,
    observer: Arc<RecordingObserver>,
    outcome: Mutex<Option<Result<(), ConnectFailReason>>>,
}

impl RecordingClientFactory {
    pub fn new(address: SocketAddr, observer: Arc<RecordingObserver>) -> Arc<Self> {
        Arc::new(Self {
            address,
            observer,
            outcome: Mutex::new(None),
        })
    }

    pub fn observer(&self) -> &Arc<RecordingObserver> {
        &self.observer
    }

    /// `None` 表示尚无结果。
    pub fn outcome(&self) -> Option<Result<(), ConnectFailReason>> {
        *self.outcome.lock()
    }
}

impl ClientConnectionObserverFactory for RecordingClientFactory {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn connection_established(&self, create_observer: CreateObserver) {
        *self.outcome.lock() = Some(Ok(()));
        create_observer.attach(Arc::clone(&self.observer) as Arc<dyn ConnectionObserver>);
    }

    fn connection_failed(&self, reason: ConnectFailReason) {
        *self.outcome.lock() = Some(Err(reason));
    }
}
