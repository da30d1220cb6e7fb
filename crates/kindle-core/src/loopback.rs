//! 内存回环传输：完整实现连接契约的测试替身。
//!
//! # 设计定位（Why）
//! - 在不触碰操作系统套接字的前提下验证契约的全部时序：发送池背压、接收窗口、
//!   数据通知闩锁、优雅关闭与中止、对端拆除原因；
//! - TLS 装饰器的握手测试同样建立在回环连接对之上。
//!
//! # 逻辑（How）
//! - 每条连接持有对端的弱引用；发送流提交后进入本端待发队列，
//!   下一轮调度把字节搬进对端的有界接收缓冲，放不下的部分留待对端 `ack_received` 后继续；
//! - 连接由 [`LoopbackNetwork`] 的注册表持有，拆除即从注册表移除；
//! - 监听端口与客户端工厂在调度器上完成握手式交接，模拟真实后端的异步性；
//!   服务端工厂拒绝（或丢弃）新连接时，客户端收到 [`DisconnectReason::Declined`]。

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use spin::Mutex;

use crate::config::ConnectionLimits;
use crate::connection::{Connection, ConnectionObserver, LinkState, Subject, notify_teardown};
use crate::dispatcher::EventDispatcher;
use crate::error::{CoreError, DisconnectReason, ErrorCategory, codes};
use crate::factory::{
    ClientConnectionObserverFactory, ConnectFailReason, CreateObserver,
    ServerConnectionObserverFactory,
};
use crate::flow::{
    OutgoingChunk, OutgoingQueue, PoolPermit, ReceiveSide, Reservation, SendBufferPool, SendSide,
};
use crate::registry::{ConnectionId, Registry};
use crate::stream::{ReceiveStream, SendStream};

const EPHEMERAL_PORT_BASE: u16 = 49152;

struct NetworkInner {
    dispatcher: EventDispatcher,
    limits: ConnectionLimits,
    pool: SendBufferPool,
    connections: Mutex<Registry<Arc<LoopbackConnection>>>,
    listeners: Mutex<BTreeMap<u16, Arc<dyn ServerConnectionObserverFactory>>>,
    next_port: Mutex<u16>,
}

impl NetworkInner {
    fn release(&self, id: Option<ConnectionId>) {
        if let Some(id) = id {
            let removed = self.connections.lock().remove(id);
            drop(removed);
        }
    }

    fn allocate_port(&self) -> u16 {
        let mut next = self.next_port.lock();
        let port = *next;
        *next = next.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
        port
    }
}

/// 内存回环网络。
///
/// # 示例
/// ```rust
/// use kindle_core::config::{ConnectionLimits, DispatcherConfig};
/// use kindle_core::connection::Connection;
/// use kindle_core::dispatcher::EventDispatcher;
/// use kindle_core::loopback::LoopbackNetwork;
///
/// let dispatcher = EventDispatcher::new(DispatcherConfig::default());
/// let network = LoopbackNetwork::new(dispatcher, ConnectionLimits::default());
/// let (client, server) = network.pair().unwrap();
/// assert_eq!(client.peer_address(), server.local_address());
/// assert_eq!(network.live_connections(), 2);
/// ```
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new(dispatcher: EventDispatcher, limits: ConnectionLimits) -> Self {
        let pool = SendBufferPool::new(limits.send_pool_chunks(), dispatcher.clone());
        Self {
            inner: Arc::new(NetworkInner {
                dispatcher,
                limits,
                pool,
                connections: Mutex::new(Registry::with_capacity(limits.max_connections())),
                listeners: Mutex::new(BTreeMap::new()),
                next_port: Mutex::new(EPHEMERAL_PORT_BASE),
            }),
        }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// 后端共享的发送池。
    pub fn pool(&self) -> &SendBufferPool {
        &self.inner.pool
    }

    /// 注册表中存活的连接数。
    pub fn live_connections(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// 直接创建一对互联的连接。
    pub fn pair(&self) -> Result<(Arc<LoopbackConnection>, Arc<LoopbackConnection>), CoreError> {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = SocketAddr::new(localhost, self.inner.allocate_port());
        let second = SocketAddr::new(localhost, self.inner.allocate_port());
        self.create_pair(first, second)
    }

    /// 在 `port` 上监听；返回的句柄被丢弃时停止监听。
    pub fn listen(
        &self,
        port: u16,
        factory: Arc<dyn ServerConnectionObserverFactory>,
    ) -> Result<LoopbackListener, CoreError> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.contains_key(&port) {
            return Err(CoreError::new(
                codes::LISTENER_EXISTS,
                alloc::format!("loopback port {port} already has a listener"),
            ));
        }
        listeners.insert(port, factory);
        tracing::debug!(port, "loopback listener registered");
        Ok(LoopbackListener {
            network: Arc::downgrade(&self.inner),
            port,
        })
    }

    /// 向 `factory.address()` 发起连接，结果在调度器上回报。
    pub fn connect(&self, factory: Arc<dyn ClientConnectionObserverFactory>) {
        let target = factory.address();
        let server = self.inner.listeners.lock().get(&target.port()).cloned();
        let Some(server) = server else {
            tracing::debug!(%target, code = ConnectFailReason::Refused.code(), "loopback connect refused");
            self.inner
                .dispatcher
                .schedule(move || factory.connection_failed(ConnectFailReason::Refused));
            return;
        };
        let origin = SocketAddr::new(target.ip(), self.inner.allocate_port());
        match self.create_pair(origin, target) {
            Ok((client, accepted)) => {
                accepted.state.lock().accepting = true;
                self.inner.dispatcher.schedule(move || {
                    server.connection_accepted(CreateObserver::new(accepted), origin);
                    factory.connection_established(CreateObserver::new(client));
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "loopback connect could not allocate a connection pair");
                self.inner
                    .dispatcher
                    .schedule(move || factory.connection_failed(ConnectFailReason::AllocationFailed));
            }
        }
    }

    fn create_pair(
        &self,
        first_addr: SocketAddr,
        second_addr: SocketAddr,
    ) -> Result<(Arc<LoopbackConnection>, Arc<LoopbackConnection>), CoreError> {
        let first = LoopbackConnection::new(&self.inner, first_addr, second_addr);
        let second = LoopbackConnection::new(&self.inner, second_addr, first_addr);
        first.state.lock().peer = Arc::downgrade(&second);
        second.state.lock().peer = Arc::downgrade(&first);

        let (first_id, second_id) = {
            let mut registry = self.inner.connections.lock();
            if registry.capacity() - registry.len() < 2 {
                return Err(CoreError::new(
                    codes::REGISTRY_FULL,
                    "loopback registry cannot hold another connection pair",
                )
                .with_category(ErrorCategory::Backpressure));
            }
            let first_id = registry.insert(Arc::clone(&first)).map_err(|_| registry_full())?;
            let second_id = registry.insert(Arc::clone(&second)).map_err(|_| registry_full())?;
            (first_id, second_id)
        };
        first.state.lock().id = Some(first_id);
        second.state.lock().id = Some(second_id);
        Ok((first, second))
    }
}

fn registry_full() -> CoreError {
    CoreError::new(codes::REGISTRY_FULL, "loopback registry is full")
        .with_category(ErrorCategory::Backpressure)
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("connections", &self.live_connections())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// 回环监听句柄。
#[derive(Debug)]
pub struct LoopbackListener {
    network: Weak<NetworkInner>,
    port: u16,
}

impl LoopbackListener {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        if let Some(network) = self.network.upgrade() {
            let removed = network.listeners.lock().remove(&self.port);
            drop(removed);
        }
    }
}

struct LoopbackState {
    id: Option<ConnectionId>,
    peer: Weak<LoopbackConnection>,
    link: LinkState,
    send: SendSide,
    receive: ReceiveSide,
    outgoing: OutgoingQueue,
    observer: Option<Arc<dyn ConnectionObserver>>,
    // 服务端一侧，监听工厂尚未挂接观察者。
    accepting: bool,
    // 对端拆除本端时的原因，晚到的挂接据此回报。
    reason: Option<DisconnectReason>,
}

/// 回环连接。
pub struct LoopbackConnection {
    this: Weak<LoopbackConnection>,
    network: Weak<NetworkInner>,
    dispatcher: EventDispatcher,
    pool: SendBufferPool,
    max_send: usize,
    local: SocketAddr,
    remote: SocketAddr,
    state: Mutex<LoopbackState>,
}

impl LoopbackConnection {
    fn new(network: &Arc<NetworkInner>, local: SocketAddr, remote: SocketAddr) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            network: Arc::downgrade(network),
            dispatcher: network.dispatcher.clone(),
            pool: network.pool.clone(),
            max_send: network.limits.max_send_stream_size(),
            local,
            remote,
            state: Mutex::new(LoopbackState {
                id: None,
                peer: Weak::new(),
                link: LinkState::Established,
                send: SendSide::new(),
                receive: ReceiveSide::with_capacity(network.limits.receive_buffer_capacity()),
                outgoing: OutgoingQueue::new(),
                observer: None,
                accepting: false,
                reason: None,
            }),
        })
    }

    /// 注册表标识；拆除后为 `None`。
    pub fn id(&self) -> Option<ConnectionId> {
        self.state.lock().id
    }

    /// 生命周期状态。
    pub fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    /// 本端待发字节数。
    pub fn pending_outgoing(&self) -> usize {
        self.state.lock().outgoing.pending_bytes()
    }

    fn schedule_self(&self, action: impl FnOnce(Arc<Self>) + Send + 'static) {
        self.dispatcher.schedule_bound(self.this.clone(), action);
    }

    fn subject(&self) -> Subject {
        let this: Weak<dyn Connection> = self.this.clone();
        Subject::new(this)
    }

    fn deliver_connected(&self) {
        let observer = {
            let state = self.state.lock();
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
            let mut state = self.state.lock();
            if !state.link.is_established() {
                return Some(permit);
            }
            if let Err(permit) = state.send.accept_slot(permit) {
                return Some(permit);
            }
        }
        // 已在调度线程上，且未持有任何锁。
        self.deliver_send_stream();
        None
    }

    fn deliver_send_stream(&self) {
        let (size, permit, observer) = {
            let mut state = self.state.lock();
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
            let mut state = self.state.lock();
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
        let peer = {
            let state = self.state.lock();
            if state.link.is_detached() {
                return;
            }
            state.peer.upgrade()
        };
        if let Some(peer) = peer {
            loop {
                let Some(data) = self.state.lock().outgoing.front_bytes() else {
                    break;
                };
                let accepted = peer.accept_inbound(&data);
                self.state.lock().outgoing.advance(accepted);
                if accepted < data.len() {
                    break;
                }
            }
        }
        let finished = {
            let state = self.state.lock();
            state.link == LinkState::Closing && state.outgoing.is_empty()
        };
        if finished {
            self.finish_close();
        }
    }

    /// 对端把字节推入本端接收缓冲，返回接受的字节数。
    fn accept_inbound(&self, data: &[u8]) -> usize {
        let (accepted, notify) = {
            let mut state = self.state.lock();
            if state.link.is_detached() {
                return data.len();
            }
            let accepted = state.receive.push(data);
            let notify = accepted > 0 && state.observer.is_some() && state.receive.raise_latch();
            (accepted, notify)
        };
        if notify {
            self.schedule_self(|connection| connection.deliver_data_received());
        }
        accepted
    }

    fn deliver_data_received(&self) {
        let observer = {
            let mut state = self.state.lock();
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

    fn finish_close(&self) {
        let (peer, id) = {
            let mut state = self.state.lock();
            if state.link.is_detached() {
                return;
            }
            state.link = LinkState::Detached;
            state.receive.clear();
            (state.peer.upgrade(), state.id.take())
        };
        tracing::debug!(connection = ?id, "loopback connection closed gracefully");
        // FIN 排在已投递的数据通知之后，对端先读完再看到关闭。
        if let Some(peer) = peer {
            peer.schedule_self(|peer| peer.peer_terminated(DisconnectReason::PeerClosed));
        }
        self.release(id);
    }

    fn peer_terminated(&self, reason: DisconnectReason) {
        let (observer, id) = {
            let mut state = self.state.lock();
            if state.link.is_detached() {
                return;
            }
            state.link = LinkState::Detached;
            state.reason = Some(reason);
            state.send.cancel(&self.pool);
            state.outgoing.clear();
            state.receive.clear();
            (state.observer.take(), state.id.take())
        };
        tracing::debug!(connection = ?id, %reason, "loopback peer terminated");
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, Some(reason));
        }
        self.release(id);
    }

    fn release(&self, id: Option<ConnectionId>) {
        if let Some(network) = self.network.upgrade() {
            network.release(id);
        }
    }
}

impl Connection for LoopbackConnection {
    fn request_send_stream(&self, size: usize) {
        let reservation = {
            let mut state = self.state.lock();
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
            let mut state = self.state.lock();
            if state.link.is_detached() {
                return ReceiveStream::empty();
            }
            state.receive.open_reader()
        };
        let this = self.this.clone();
        ReceiveStream::new(snapshot, cursor, move || {
            if let Some(connection) = this.upgrade() {
                connection.state.lock().receive.close_reader();
            }
        })
    }

    fn ack_received(&self) {
        let peer = {
            let mut state = self.state.lock();
            if state.receive.ack() > 0 {
                state.peer.upgrade()
            } else {
                None
            }
        };
        if let Some(peer) = peer {
            peer.schedule_self(|peer| peer.flush());
        }
    }

    fn close_and_destroy(&self) {
        let observer = {
            let mut state = self.state.lock();
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
        let (observer, peer, id, reason) = {
            let mut state = self.state.lock();
            if state.link.is_detached() {
                return;
            }
            state.link = LinkState::Detached;
            state.send.cancel(&self.pool);
            state.outgoing.clear();
            state.receive.clear();
            // 监听工厂未挂接就中止，即拒绝了这条连接。
            let reason = if state.accepting {
                DisconnectReason::Declined
            } else {
                DisconnectReason::PeerReset
            };
            (state.observer.take(), state.peer.upgrade(), state.id.take(), reason)
        };
        tracing::debug!(connection = ?id, %reason, "loopback connection aborted");
        if let Some(observer) = observer {
            notify_teardown(&self.dispatcher, observer, None);
        }
        if let Some(peer) = peer {
            peer.peer_terminated(reason);
        }
        self.release(id);
    }

    fn attach(&self, observer: Arc<dyn ConnectionObserver>) {
        let pending_data = {
            let mut state = self.state.lock();
            assert!(
                state.observer.is_none(),
                "connection already has an observer attached"
            );
            if state.link.is_detached() {
                Err(state.reason.unwrap_or(DisconnectReason::PeerReset))
            } else {
                state.accepting = false;
                state.observer = Some(Arc::clone(&observer));
                Ok(!state.receive.buffer().is_empty() && state.receive.raise_latch())
            }
        };
        let pending_data = match pending_data {
            Ok(pending_data) => pending_data,
            Err(reason) => {
                notify_teardown(&self.dispatcher, observer, Some(reason));
                return;
            }
        };
        observer.attached(self.subject());
        self.schedule_self(|connection| connection.deliver_connected());
        if pending_data {
            self.schedule_self(|connection| connection.deliver_data_received());
        }
    }

    fn is_attached(&self) -> bool {
        self.state.lock().observer.is_some()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackConnection")
            .field("id", &state.id)
            .field("link", &state.link)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}
