//! 非阻塞 TCP 连接。
//!
//! # 设计定位（Why）
//! - 把边沿触发的套接字就绪事件翻译为连接契约：读到的字节进入有界接收缓冲，
//!   发送流提交的字节进入待发队列，二者都在调度线程上推进；
//! - 观察者回调一律经调度器投递，连接在持有自身锁时只做套接字读写。
//!
//! # 逻辑（How）
//! - 接收：循环读取直到 `WouldBlock` 或缓冲写满；写满时记下暂停标记，
//!   待 `ack_received` 腾出空间后主动补读一次（边沿触发不会再次通知）；
//! - 发送：循环写出直到 `WouldBlock`，剩余字节留在队列等待下一次可写事件；
//!   池槽位随待发块一起释放，背压因此反映到内核发送缓冲；
//! - 拆除：读到 0 字节为对端有序关闭，读写硬错误按种类映射为断开原因，
//!   优雅关闭在冲刷完毕后丢弃内核中未读的入站字节、半关闭写方向再释放
//!   （带着未读数据关闭套接字会让内核以 RST 代替 FIN），中止设置 `SO_LINGER=0` 后立即释放。

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use kindle_core::connection::{
    Connection, ConnectionObserver, LinkState, Subject, notify_teardown,
};
use kindle_core::dispatcher::EventDispatcher;
use kindle_core::error::DisconnectReason;
use kindle_core::flow::{
    OutgoingChunk, OutgoingQueue, PoolPermit, ReceiveSide, Reservation, SendBufferPool, SendSide,
};
use kindle_core::registry::ConnectionId;
use kindle_core::stream::{ReceiveStream, SendStream};
use kindle_core::sync::lock;
use mio::net::TcpStream;
use socket2::SockRef;

use crate::error::{self, OperationKind, disconnect_reason, map_io_error};
use crate::event_loop::Readiness;
use crate::network::NetworkShared;

const READ_CHUNK: usize = 2048;

struct ConnectionState {
    id: Option<ConnectionId>,
    stream: Option<TcpStream>,
    link: LinkState,
    send: SendSide,
    receive: ReceiveSide,
    outgoing: OutgoingQueue,
    observer: Option<Arc<dyn ConnectionObserver>>,
    peer_closed: bool,
}

impl ConnectionState {
    /// 标记拆除并交出需要在锁外处理的资源。
    fn detach(&mut self, pool: &SendBufferPool) -> Teardown {
        self.link = LinkState::Detached;
        self.send.cancel(pool);
        self.outgoing.clear();
        self.receive.clear();
        Teardown {
            id: self.id.take(),
            stream: self.stream.take(),
            observer: self.observer.take(),
        }
    }
}

struct Teardown {
    id: Option<ConnectionId>,
    stream: Option<TcpStream>,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

enum ReceiveOutcome {
    Drained,
    Stalled,
    Closed,
    Failed(io::Error),
}

enum FlushOutcome {
    Drained,
    Blocked,
    Failed(io::Error),
}

/// 已连通的 TCP 连接。
pub struct TcpConnection {
    this: Weak<TcpConnection>,
    network: Weak<NetworkShared>,
    dispatcher: EventDispatcher,
    pool: SendBufferPool,
    max_send: usize,
    local: SocketAddr,
    peer: SocketAddr,
    state: Mutex<ConnectionState>,
}

impl TcpConnection {
    pub(crate) fn new(network: &Arc<NetworkShared>, local: SocketAddr, peer: SocketAddr) -> Arc<Self> {
        let limits = network.config.limits();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            network: Arc::downgrade(network),
            dispatcher: network.dispatcher.clone(),
            pool: network.pool.clone(),
            max_send: limits.max_send_stream_size(),
            local,
            peer,
            state: Mutex::new(ConnectionState {
                id: None,
                stream: None,
                link: LinkState::Established,
                send: SendSide::new(),
                receive: ReceiveSide::with_capacity(limits.receive_buffer_capacity()),
                outgoing: OutgoingQueue::new(),
                observer: None,
                peer_closed: false,
            }),
        })
    }

    /// 注册完成后交付流与标识。
    pub(crate) fn install(&self, id: ConnectionId, stream: TcpStream) {
        let mut state = self.lock();
        state.id = Some(id);
        state.stream = Some(stream);
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    /// 注册表标识；拆除后为 `None`。
    pub fn id(&self) -> Option<ConnectionId> {
        self.lock().id
    }

    pub fn link_state(&self) -> LinkState {
        self.lock().link
    }

    /// 尚未写入内核的字节数。
    pub fn pending_outgoing(&self) -> usize {
        self.lock().outgoing.pending_bytes()
    }

    fn schedule_self(&self, action: impl FnOnce(Arc<Self>) + Send + 'static) {
        self.dispatcher.schedule_bound(self.this.clone(), action);
    }

    fn subject(&self) -> Subject {
        let this: Weak<dyn Connection> = self.this.clone();
        Subject::new(this)
    }

    pub(crate) fn ready(&self, readiness: Readiness) {
        if readiness.writable || readiness.error {
            self.flush();
        }
        if readiness.readable || readiness.read_closed || readiness.error {
            self.receive();
        }
    }

    fn receive(&self) {
        let (outcome, notify) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.link.is_established() || state.peer_closed {
                return;
            }
            let Some(stream) = state.stream.as_mut() else {
                return;
            };
            let mut chunk = [0u8; READ_CHUNK];
            let mut received = 0;
            let outcome = loop {
                let room = state.receive.buffer().remaining().min(READ_CHUNK);
                if room == 0 {
                    state.receive.set_stalled(true);
                    break ReceiveOutcome::Stalled;
                }
                match stream.read(&mut chunk[..room]) {
                    Ok(0) => break ReceiveOutcome::Closed,
                    Ok(count) => {
                        state.receive.push(&chunk[..count]);
                        received += count;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break ReceiveOutcome::Drained;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => break ReceiveOutcome::Failed(err),
                }
            };
            if matches!(outcome, ReceiveOutcome::Closed) {
                state.peer_closed = true;
            }
            let notify = received > 0 && state.observer.is_some() && state.receive.raise_latch();
            tracing::trace!(connection = ?state.id, received, "tcp receive");
            (outcome, notify)
        };
        if notify {
            self.schedule_self(|connection| connection.deliver_data_received());
        }
        match outcome {
            ReceiveOutcome::Drained | ReceiveOutcome::Stalled => {}
            // 已投递的数据通知先于关闭通知执行。
            ReceiveOutcome::Closed => {
                self.schedule_self(|connection| connection.terminate(DisconnectReason::PeerClosed));
            }
            ReceiveOutcome::Failed(err) => self.fail(error::READ, err),
        }
    }

    fn deliver_data_received(&self) {
        let observer = {
            let mut state = self.lock();
            state.receive.lower_latch();
            if state.link.is_established() {
                state.observer.clone()
            } else {
                None
            }
        };
        if let Some(observer) = observer {
            observer.data_received();
        }
    }

    fn deliver_connected(&self) {
        let observer = {
            let state = self.lock();
            if state.link.is_established() {
                state.observer.clone()
            } else {
                None
            }
        };
        if let Some(observer) = observer {
            observer.connected();
        }
    }

    /// 发送池转交的槽位；连接已拆除或请求已撤销时退回。
    fn accept_slot(&self, permit: PoolPermit) -> Option<PoolPermit> {
        {
            let mut state = self.lock();
            if !state.link.is_established() {
                return Some(permit);
            }
            if let Err(permit) = state.send.accept_slot(permit) {
                return Some(permit);
            }
        }
        self.deliver_send_stream();
        None
    }

    fn deliver_send_stream(&self) {
        let (size, permit, observer) = {
            let mut state = self.lock();
            if !state.link.is_established() {
                return;
            }
            let Some(observer) = state.observer.clone() else {
                return;
            };
            let Some((size, permit)) = state.send.take_grant() else {
                return;
            };
            (size, permit, observer)
        };
        let this = self.this.clone();
        let stream = SendStream::new(size, move |bytes| {
            if let Some(connection) = this.upgrade() {
                connection.commit(bytes, permit);
            }
        });
        observer.send_stream_available(stream);
    }

    fn commit(&self, bytes: Vec<u8>, permit: PoolPermit) {
        let queued = {
            let mut state = self.lock();
            state.send.complete();
            if bytes.is_empty() || state.link.is_detached() {
                false
            } else {
                state
                    .outgoing
                    .push(OutgoingChunk::new(Bytes::from(bytes), permit));
                true
            }
        };
        if queued {
            self.schedule_self(|connection| connection.flush());
        }
    }

    fn flush(&self) {
        let (outcome, closing) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.link.is_detached() {
                return;
            }
            let Some(stream) = state.stream.as_mut() else {
                return;
            };
            let outcome = loop {
                let Some(data) = state.outgoing.front_bytes() else {
                    break FlushOutcome::Drained;
                };
                match stream.write(&data) {
                    Ok(0) => break FlushOutcome::Failed(io::ErrorKind::WriteZero.into()),
                    Ok(count) => state.outgoing.advance(count),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break FlushOutcome::Blocked;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => break FlushOutcome::Failed(err),
                }
            };
            (outcome, state.link == LinkState::Closing)
        };
        match outcome {
            FlushOutcome::Drained if closing => self.finish_close(),
            FlushOutcome::Drained | FlushOutcome::Blocked => {}
            FlushOutcome::Failed(err) => self.fail(error::WRITE, err),
        }
    }

    /// 冲刷完毕后丢弃未读入站字节、半关闭写方向并释放。
    fn finish_close(&self) {
        let mut teardown = {
            let mut state = self.lock();
            if state.link.is_detached() {
                return;
            }
            state.detach(&self.pool)
        };
        if let Some(stream) = teardown.stream.as_mut() {
            let discarded = discard_inbound(stream);
            if discarded > 0 {
                tracing::trace!(connection = ?teardown.id, discarded, "unread inbound bytes discarded before close");
            }
            if let Err(err) = stream.shutdown(Shutdown::Write) {
                let err = map_io_error(error::SHUTDOWN, err);
                tracing::debug!(connection = ?teardown.id, error = %err, "tcp shutdown failed");
            }
        }
        tracing::debug!(connection = ?teardown.id, peer = %self.peer, "tcp connection closed gracefully");
        self.release(teardown, None);
    }

    fn fail(&self, kind: OperationKind, err: io::Error) {
        let reason = disconnect_reason(kind, &err);
        let err = map_io_error(kind, err);
        tracing::warn!(peer = %self.peer, error = %err, %reason, "tcp connection failed");
        self.terminate(reason);
    }

    /// 非观察者发起的拆除。
    fn terminate(&self, reason: DisconnectReason) {
        let teardown = {
            let mut state = self.lock();
            if state.link.is_detached() {
                return;
            }
            state.detach(&self.pool)
        };
        tracing::debug!(connection = ?teardown.id, peer = %self.peer, %reason, "tcp connection terminated");
        self.release(teardown, Some(reason));
    }

    /// 注销套接字、从注册表移除并投递拆除通知。
    fn release(&self, teardown: Teardown, reason: Option<DisconnectReason>) {
        let Teardown {
            id,
            stream,
            observer,
        } = teardown;
        let network = self.network.upgrade();
        if let (Some(network), Some(mut stream)) = (&network, stream) {
            if let Err(err) = network.registry.deregister(&mut stream) {
                tracing::trace!(error = %err, "tcp deregister failed");
            }
        }
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, reason);
        }
        if let (Some(network), Some(id)) = (network, id) {
            network.release(id);
        }
    }
}

impl Connection for TcpConnection {
    fn request_send_stream(&self, size: usize) {
        let reservation = {
            let mut state = self.lock();
            if !state.link.is_established() {
                tracing::debug!(connection = ?state.id, "send stream requested on a closed connection");
                return;
            }
            let this = self.this.clone();
            let reservation = state.send.request(size, self.max_send, &self.pool, move |permit| {
                match this.upgrade() {
                    Some(connection) => connection.accept_slot(permit),
                    None => Some(permit),
                }
            });
            if reservation == Reservation::Queued {
                tracing::trace!(connection = ?state.id, "send pool exhausted; request queued");
            }
            reservation
        };
        if reservation == Reservation::Granted {
            self.schedule_self(|connection| connection.deliver_send_stream());
        }
    }

    fn max_send_stream_size(&self) -> usize {
        self.max_send
    }

    fn receive_stream(&self) -> ReceiveStream {
        let (snapshot, cursor) = {
            let mut state = self.lock();
            if state.link.is_detached() {
                return ReceiveStream::empty();
            }
            state.receive.open_reader()
        };
        let this = self.this.clone();
        ReceiveStream::new(snapshot, cursor, move || {
            if let Some(connection) = this.upgrade() {
                connection.lock().receive.close_reader();
            }
        })
    }

    fn ack_received(&self) {
        let resume = {
            let mut state = self.lock();
            state.receive.ack() > 0 && state.receive.take_stalled()
        };
        if resume {
            self.schedule_self(|connection| connection.receive());
        }
    }

    fn close_and_destroy(&self) {
        let observer = {
            let mut state = self.lock();
            if !state.link.is_established() {
                return;
            }
            state.link = LinkState::Closing;
            state.send.cancel(&self.pool);
            state.observer.take()
        };
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, None);
        }
        self.schedule_self(|connection| connection.flush());
    }

    fn abort_and_destroy(&self) {
        let teardown = {
            let mut state = self.lock();
            if state.link.is_detached() {
                return;
            }
            state.detach(&self.pool)
        };
        if let Some(stream) = &teardown.stream {
            if let Err(err) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
                tracing::debug!(error = %err, "failed to arm SO_LINGER=0 before abort");
            }
        }
        tracing::debug!(connection = ?teardown.id, peer = %self.peer, "tcp connection aborted");
        self.release(teardown, None);
    }

    fn attach(&self, observer: Arc<dyn ConnectionObserver>) {
        let pending_data = {
            let mut state = self.lock();
            assert!(
                state.observer.is_none(),
                "connection already has an observer attached"
            );
            if state.link.is_detached() {
                None
            } else {
                state.observer = Some(Arc::clone(&observer));
                Some(!state.receive.buffer().is_empty() && state.receive.raise_latch())
            }
        };
        let Some(pending_data) = pending_data else {
            notify_teardown(&self.dispatcher, observer, Some(DisconnectReason::PeerReset));
            return;
        };
        observer.attached(self.subject());
        self.schedule_self(|connection| connection.deliver_connected());
        if pending_data {
            self.schedule_self(|connection| connection.deliver_data_received());
        }
    }

    fn is_attached(&self) -> bool {
        self.lock().observer.is_some()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// 读空内核接收队列并丢弃，返回丢弃的字节数；遇到 `WouldBlock`、EOF 或错误即停。
fn discard_inbound(stream: &mut TcpStream) -> usize {
    let mut scratch = [0u8; READ_CHUNK];
    let mut discarded = 0;
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(count) => discarded += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    discarded
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TcpConnection")
            .field("id", &state.id)
            .field("link", &state.link)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("pending_outgoing", &state.outgoing.pending_bytes())
            .finish()
    }
}
