//! TLS 装饰连接：底层连接的观察者，同时是上层观察者的主体。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 上层协议面对的连接契约与明文传输完全一致，加解密对其透明；
//! - 底层可以是套接字连接、回环替身或任何实现了 [`Connection`] 的对象。
//!
//! ## 逻辑 (How)
//! - **握手驱动**：引擎有待发记录时向底层请求发送流，交付后把记录写进去；底层交付入站密文时
//!   送入引擎处理并再次尝试输出，直到握手完成；
//! - **明文发送**：只有在握手完成且引擎的待发记录已全部写出后，才把明文发送流交给观察者，
//!   释放时明文进入引擎加密，随即触发一次密文输出；
//! - **明文接收**：解密结果进入有界明文缓冲，缓冲写满时停止消费底层密文，
//!   未消费的密文留在底层接收缓冲中，待观察者确认后再继续；
//! - **关闭**：观察者关闭时先发送 `close_notify`，冲刷完成后关闭底层；
//!   收到对端 `close_notify` 时以 `PeerClosed` 拆除。
//!
//! ## 契约 (What)
//! - 观察者回调一律经调度器投递，连接绝不在持有自身锁时调用底层或观察者；
//! - 握手或记录层失败先经 [`TlsFailureHooks`] 上报，再以弱绑定调度中止底层连接，
//!   即便失败是在观察者释放发送流的调用栈中发现的，也不会就地拆除；
//! - 握手失败时使对应目标的客户端会话缓存失效。
//!
//! ## 注意事项 (Trade-offs)
//! - 底层连接持有本对象的强引用（作为它的观察者），本对象只经 [`SubjectSlot`] 弱引用底层，
//!   存活期仍由底层后端的注册表统一掌管。

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use kindle_core::connection::{
    Connection, ConnectionObserver, Subject, SubjectSlot, notify_teardown,
};
use kindle_core::dispatcher::EventDispatcher;
use kindle_core::error::DisconnectReason;
use kindle_core::flow::ReceiveSide;
use kindle_core::stream::{ReceiveStream, SendStream, StreamGate};
use kindle_core::sync::lock;
use rustls::HandshakeKind;

use crate::config::TlsConfig;
use crate::engine::{CipherReader, Engine};
use crate::failure::{FailureKind, TlsFailure, TlsFailureHooks, report_failure};
use crate::session_cache::{ClientSessionCache, SessionKey};

const PLAINTEXT_CHUNK: usize = 1024;

/// TLS 连接阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsPhase {
    /// 等待底层建立或握手进行中。
    InitialHandshake,
    /// 握手完成，可收发明文。
    Established,
    /// 已发出 `close_notify`，正在冲刷。
    Closing,
    /// 引擎报告了终止性失败。
    Failed,
    /// 已拆除。
    Closed,
}

impl TlsPhase {
    fn is_open(self) -> bool {
        matches!(self, Self::InitialHandshake | Self::Established)
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// 客户端连接对应的会话缓存条目，握手失败时据此失效。
pub(crate) struct SessionBinding {
    pub(crate) cache: ClientSessionCache,
    pub(crate) key: SessionKey,
}

struct TlsState {
    phase: TlsPhase,
    engine: Engine,
    gate: StreamGate,
    plaintext: ReceiveSide,
    observer: Option<Arc<dyn ConnectionObserver>>,
    close_notify_seen: bool,
    // 已向底层请求、尚未交付的密文发送流。
    underlying_requested: bool,
    transport_reason: Option<DisconnectReason>,
}

/// 一次拉取的结果，锁外处理。
#[derive(Default)]
struct Pulled {
    handshake_done: bool,
    notify: bool,
    peer_closed: bool,
    failure: Option<TlsFailure>,
}

enum Output {
    Request,
    Finish,
    Idle,
}

/// TLS 装饰连接。
pub struct TlsConnection {
    this: Weak<TlsConnection>,
    dispatcher: EventDispatcher,
    hooks: Arc<dyn TlsFailureHooks>,
    session: Option<SessionBinding>,
    max_send: usize,
    underlying: SubjectSlot,
    state: Mutex<TlsState>,
}

impl TlsConnection {
    pub(crate) fn new(
        dispatcher: EventDispatcher,
        engine: Engine,
        config: &TlsConfig,
        hooks: Arc<dyn TlsFailureHooks>,
        session: Option<SessionBinding>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            dispatcher,
            hooks,
            session,
            max_send: config.max_plaintext_send(),
            underlying: SubjectSlot::new(),
            state: Mutex::new(TlsState {
                phase: TlsPhase::InitialHandshake,
                engine,
                gate: StreamGate::new(),
                plaintext: ReceiveSide::with_capacity(config.plaintext_receive_capacity()),
                observer: None,
                close_notify_seen: false,
                underlying_requested: false,
                transport_reason: None,
            }),
        })
    }

    pub fn phase(&self) -> TlsPhase {
        lock(&self.state).phase
    }

    /// 本次握手是否复用了缓存的会话。
    pub fn is_resumed(&self) -> bool {
        lock(&self.state).engine.handshake_kind() == Some(HandshakeKind::Resumed)
    }

    /// 协商出的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        lock(&self.state).engine.alpn_protocol()
    }

    /// 被装饰的底层连接（若仍存活）。
    pub fn underlying(&self) -> Option<Arc<dyn Connection>> {
        self.underlying.get()
    }

    fn schedule_self(&self, action: impl FnOnce(Arc<Self>) + Send + 'static) {
        self.dispatcher.schedule_bound(self.this.clone(), action);
    }

    fn as_subject(&self) -> Subject {
        let this: Weak<dyn Connection> = self.this.clone();
        Subject::new(this)
    }

    /// 引擎有待发记录时向底层请求发送流；关闭阶段冲刷完毕后关闭底层。
    fn try_send(&self) {
        let output = {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() || state.underlying_requested {
                Output::Idle
            } else if state.engine.wants_write() {
                state.underlying_requested = true;
                Output::Request
            } else if state.phase == TlsPhase::Closing {
                state.phase = TlsPhase::Closed;
                Output::Finish
            } else {
                Output::Idle
            }
        };
        match output {
            Output::Request => match self.underlying.get() {
                Some(underlying) => {
                    underlying.request_send_stream(underlying.max_send_stream_size());
                }
                None => lock(&self.state).underlying_requested = false,
            },
            Output::Finish => {
                tracing::debug!(peer = ?self.peer_address(), "tls close_notify flushed; closing transport");
                if let Some(underlying) = self.underlying.get() {
                    underlying.close_and_destroy();
                }
            }
            Output::Idle => {}
        }
    }

    /// 条件满足时安排把明文发送流交给观察者。
    fn offer_writer(&self) {
        let ready = {
            let state = lock(&self.state);
            state.phase == TlsPhase::Established
                && state.gate.is_requested()
                && !state.engine.wants_write()
                && state.observer.is_some()
        };
        if ready {
            self.schedule_self(|tls| tls.deliver_send_stream());
        }
    }

    fn deliver_send_stream(&self) {
        let (size, observer) = {
            let mut state = lock(&self.state);
            if state.phase != TlsPhase::Established || state.engine.wants_write() {
                return;
            }
            let Some(observer) = state.observer.clone() else {
                return;
            };
            let Some(size) = state.gate.grant() else {
                return;
            };
            (size, observer)
        };
        let this = self.this.clone();
        let stream = SendStream::new(size, move |bytes| {
            if let Some(tls) = this.upgrade() {
                tls.commit_plaintext(&bytes);
            }
        });
        observer.send_stream_available(stream);
    }

    fn commit_plaintext(&self, bytes: &[u8]) {
        let failure = {
            let mut state = lock(&self.state);
            state.gate.complete();
            if bytes.is_empty() || state.phase != TlsPhase::Established {
                return;
            }
            state
                .engine
                .write_plaintext(bytes)
                .err()
                .map(|err| TlsFailure::Write(err.kind()))
        };
        match failure {
            Some(failure) => self.fail(failure),
            None => self.try_send(),
        }
    }

    /// 从底层拉取密文、解密进明文缓冲，并处理握手推进与对端关闭。
    fn pull(&self) {
        let Some(underlying) = self.underlying.get() else {
            return;
        };
        let mut reader = underlying.receive_stream();
        let pulled = {
            let mut state = lock(&self.state);
            if !state.phase.is_open() {
                return;
            }
            let was_handshaking = state.engine.is_handshaking();
            let buffered = state.plaintext.buffer().len();
            let mut pulled = Pulled::default();
            loop {
                drain_plaintext(&mut state);
                if !state.engine.wants_read() || reader.is_empty() {
                    break;
                }
                match state.engine.read_tls(&mut CipherReader::new(&mut reader)) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let err = rustls::Error::General(err.to_string());
                        pulled.failure = Some(inbound_failure(was_handshaking, err));
                        break;
                    }
                }
                match state.engine.process_new_packets() {
                    Ok(io_state) => {
                        if io_state.peer_has_closed() && !state.close_notify_seen {
                            state.close_notify_seen = true;
                            pulled.peer_closed = true;
                        }
                    }
                    Err(err) => {
                        let handshaking = was_handshaking && state.engine.is_handshaking();
                        pulled.failure = Some(inbound_failure(handshaking, err));
                        break;
                    }
                }
            }
            let gained = state.plaintext.buffer().len() - buffered;
            if pulled.failure.is_none() {
                pulled.handshake_done = was_handshaking && !state.engine.is_handshaking();
                if pulled.handshake_done {
                    state.phase = TlsPhase::Established;
                }
                pulled.notify = gained > 0
                    && state.phase == TlsPhase::Established
                    && state.observer.is_some()
                    && state.plaintext.raise_latch();
            }
            let stalled = state.plaintext.buffer().is_full();
            state.plaintext.set_stalled(stalled);
            pulled
        };
        drop(reader);
        underlying.ack_received();

        if let Some(failure) = pulled.failure {
            self.fail(failure);
            return;
        }
        if pulled.handshake_done {
            tracing::debug!(peer = ?self.peer_address(), resumed = self.is_resumed(), "tls handshake completed");
            self.schedule_self(|tls| tls.deliver_connected());
        }
        if pulled.notify {
            self.schedule_self(|tls| tls.deliver_data_received());
        }
        if pulled.peer_closed {
            // 排在明文通知之后，观察者先读完再看到关闭。
            self.schedule_self(|tls| tls.peer_closed());
        }
        self.try_send();
        self.offer_writer();
    }

    fn deliver_connected(&self) {
        let observer = {
            let state = lock(&self.state);
            if state.phase == TlsPhase::Established {
                state.observer.clone()
            } else {
                None
            }
        };
        if let Some(observer) = observer {
            observer.connected();
        }
        self.offer_writer();
    }

    fn deliver_data_received(&self) {
        let observer = {
            let mut state = lock(&self.state);
            state.plaintext.lower_latch();
            if state.phase == TlsPhase::Established {
                state.observer.clone()
            } else {
                None
            }
        };
        if let Some(observer) = observer {
            observer.data_received();
        }
    }

    fn peer_closed(&self) {
        let observer = {
            let mut state = lock(&self.state);
            if !state.phase.is_open() {
                return;
            }
            state.phase = TlsPhase::Closing;
            state.gate.cancel();
            state.engine.send_close_notify();
            state.observer.take()
        };
        tracing::debug!(peer = ?self.peer_address(), "tls peer sent close_notify");
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, Some(DisconnectReason::PeerClosed));
        }
        self.try_send();
    }

    /// 终止性失败：上报钩子、失效会话缓存，并在下一轮调度中止底层。
    fn fail(&self, failure: TlsFailure) {
        let observer = {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            state.phase = TlsPhase::Failed;
            state.gate.cancel();
            state.plaintext.clear();
            state.observer.take()
        };
        let peer = self.peer_address();
        report_failure(self.hooks.as_ref(), peer, &failure);
        if failure.kind() == FailureKind::Init {
            if let Some(session) = &self.session {
                session.cache.invalidate(&session.key);
            }
        }
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, Some(failure.disconnect_reason()));
        }
        self.schedule_self(|tls| {
            if let Some(underlying) = tls.underlying.get() {
                underlying.abort_and_destroy();
            }
        });
    }
}

fn drain_plaintext(state: &mut TlsState) {
    let mut chunk = [0u8; PLAINTEXT_CHUNK];
    while !state.plaintext.buffer().is_full() {
        let want = chunk.len().min(state.plaintext.buffer().remaining());
        match state.engine.read_plaintext(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(read) => {
                state.plaintext.push(&chunk[..read]);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                tracing::trace!(error = %err, "tls plaintext reader stopped");
                break;
            }
        }
    }
}

fn inbound_failure(handshaking: bool, err: rustls::Error) -> TlsFailure {
    if handshaking {
        TlsFailure::Handshake(err)
    } else {
        TlsFailure::Read(err)
    }
}

impl ConnectionObserver for TlsConnection {
    fn subject_slot(&self) -> &SubjectSlot {
        &self.underlying
    }

    fn connected(&self) {
        // 客户端此时已有 ClientHello 待发；服务端等待对端先说话。
        self.try_send();
    }

    fn send_stream_available(&self, mut stream: SendStream) {
        let failure = {
            let mut state = lock(&self.state);
            state.underlying_requested = false;
            let mut failure = None;
            if !state.phase.is_terminal() {
                while state.engine.wants_write() {
                    match state.engine.write_tls(&mut stream) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            failure = Some(TlsFailure::Write(err.kind()));
                            break;
                        }
                    }
                }
            }
            failure
        };
        // 释放即把密文提交给底层。
        drop(stream);
        if let Some(failure) = failure {
            self.fail(failure);
            return;
        }
        self.try_send();
        self.offer_writer();
    }

    fn data_received(&self) {
        self.pull();
    }

    fn closing_connection(&self, reason: DisconnectReason) {
        lock(&self.state).transport_reason = Some(reason);
    }

    fn detached(&self) {
        self.underlying.clear();
        let (observer, reason) = {
            let mut state = lock(&self.state);
            if state.phase != TlsPhase::Failed {
                state.phase = TlsPhase::Closed;
            }
            state.gate.cancel();
            state.plaintext.clear();
            let reason = state
                .transport_reason
                .take()
                .unwrap_or(DisconnectReason::PeerReset);
            (state.observer.take(), reason)
        };
        if let Some(observer) = observer {
            tracing::debug!(%reason, "tls transport detached");
            notify_teardown(&self.dispatcher, observer, Some(reason));
        }
    }
}

impl Connection for TlsConnection {
    fn request_send_stream(&self, size: usize) {
        {
            let mut state = lock(&self.state);
            if !state.phase.is_open() {
                tracing::debug!(phase = ?state.phase, "send stream requested on a closed tls connection");
                return;
            }
            state.gate.request(size, self.max_send);
        }
        self.offer_writer();
    }

    fn max_send_stream_size(&self) -> usize {
        self.max_send
    }

    fn receive_stream(&self) -> ReceiveStream {
        let (snapshot, cursor) = {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return ReceiveStream::empty();
            }
            state.plaintext.open_reader()
        };
        let this = self.this.clone();
        ReceiveStream::new(snapshot, cursor, move || {
            if let Some(tls) = this.upgrade() {
                lock(&tls.state).plaintext.close_reader();
            }
        })
    }

    fn ack_received(&self) {
        let resume = {
            let mut state = lock(&self.state);
            state.plaintext.ack() > 0 && state.plaintext.take_stalled()
        };
        if resume {
            self.schedule_self(|tls| tls.pull());
        }
    }

    fn close_and_destroy(&self) {
        let observer = {
            let mut state = lock(&self.state);
            if !state.phase.is_open() {
                return;
            }
            state.phase = TlsPhase::Closing;
            state.gate.cancel();
            state.engine.send_close_notify();
            state.observer.take()
        };
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, None);
        }
        self.try_send();
    }

    fn abort_and_destroy(&self) {
        let observer = {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            state.phase = TlsPhase::Closed;
            state.gate.cancel();
            state.plaintext.clear();
            state.observer.take()
        };
        tracing::debug!(peer = ?self.peer_address(), "tls connection aborted");
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, None);
        }
        if let Some(underlying) = self.underlying.get() {
            underlying.abort_and_destroy();
        }
    }

    fn attach(&self, observer: Arc<dyn ConnectionObserver>) {
        let attached = {
            let mut state = lock(&self.state);
            assert!(
                state.observer.is_none(),
                "connection already has an observer attached"
            );
            if state.phase.is_terminal() || state.phase == TlsPhase::Closing {
                None
            } else {
                state.observer = Some(Arc::clone(&observer));
                let established = state.phase == TlsPhase::Established;
                let pending = established
                    && !state.plaintext.buffer().is_empty()
                    && state.plaintext.raise_latch();
                Some((established, pending))
            }
        };
        let Some((established, pending_data)) = attached else {
            notify_teardown(&self.dispatcher, observer, Some(DisconnectReason::PeerReset));
            return;
        };
        observer.attached(self.as_subject());
        if established {
            self.schedule_self(|tls| tls.deliver_connected());
        }
        if pending_data {
            self.schedule_self(|tls| tls.deliver_data_received());
        }
    }

    fn is_attached(&self) -> bool {
        lock(&self.state).observer.is_some()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.underlying.get().and_then(|underlying| underlying.local_address())
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.underlying.get().and_then(|underlying| underlying.peer_address())
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("TlsConnection")
            .field("role", &if state.engine.is_client() { "client" } else { "server" })
            .field("phase", &state.phase)
            .field("plaintext", &state.plaintext.buffer().len())
            .field("attached", &state.observer.is_some())
            .finish()
    }
}
