//! 套接字注册表与就绪事件分派。
//!
//! # 设计定位（Why）
//! - 连接、监听器与连接器都以注册表标识作为 `mio` 令牌，事件到达时按代际校验找回对象，
//!   已拆除对象的迟到事件因代际不匹配被自然丢弃；
//! - 注册表持有所有套接字对象的唯一强引用，拆除即移除，不依赖“对象持有自身”的技巧。

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use kindle_core::dispatcher::EventDispatcher;
use kindle_core::error::{CoreError, ErrorCategory, codes};
use kindle_core::factory::{ClientConnectionObserverFactory, ServerConnectionObserverFactory};
use kindle_core::flow::SendBufferPool;
use kindle_core::registry::{ConnectionId, Registry};
use kindle_core::sync::lock;
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::config::TcpConfig;
use crate::connection::TcpConnection;
use crate::connector::{ConnectorId, PendingConnect};
use crate::error::{self, map_io_error};
use crate::event_loop::Readiness;
use crate::listener::{ListenerSocket, TcpListenerHandle};

/// 注册表条目：三类套接字对象。
#[derive(Clone)]
pub(crate) enum SocketEntry {
    Connection(Arc<TcpConnection>),
    Listener(Arc<ListenerSocket>),
    Connector(Arc<PendingConnect>),
}

/// 新连接的注册方式。
pub(crate) enum Registration {
    /// 首次向 `poll` 注册（监听器接受的连接）。
    Fresh,
    /// 已以连接器身份注册过，改用新令牌重新注册。
    Existing,
}

pub(crate) struct NetworkShared {
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) registry: mio::Registry,
    pub(crate) config: TcpConfig,
    pub(crate) pool: SendBufferPool,
    sockets: Mutex<Registry<SocketEntry>>,
}

impl NetworkShared {
    pub(crate) fn insert(&self, entry: SocketEntry) -> Result<ConnectionId, CoreError> {
        lock(&self.sockets).insert(entry).map_err(|_| {
            CoreError::new(codes::REGISTRY_FULL, "tcp socket registry is full")
                .with_category(ErrorCategory::Backpressure)
        })
    }

    /// 移除条目；被移除对象的析构在锁外进行。
    pub(crate) fn release(&self, id: ConnectionId) {
        let removed = lock(&self.sockets).remove(id);
        drop(removed);
    }

    pub(crate) fn entry(&self, id: ConnectionId) -> Option<SocketEntry> {
        lock(&self.sockets).get(id).cloned()
    }

    /// 把已连通的流纳入注册表并登记就绪兴趣。
    pub(crate) fn adopt(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        registration: Registration,
    ) -> Result<Arc<TcpConnection>, CoreError> {
        self.config
            .socket()
            .apply(&stream)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;

        // 令牌来自注册表槽位，必须先插入再登记兴趣。
        let connection = TcpConnection::new(self, local, peer);
        let id = self.insert(SocketEntry::Connection(Arc::clone(&connection)))?;
        let token = Token(id.to_token());
        let interest = Interest::READABLE | Interest::WRITABLE;
        let registered = match registration {
            Registration::Fresh => self.registry.register(&mut stream, token, interest),
            Registration::Existing => self.registry.reregister(&mut stream, token, interest),
        };
        if let Err(err) = registered {
            self.release(id);
            return Err(map_io_error(error::REGISTER, err));
        }
        connection.install(id, stream);
        tracing::debug!(connection = ?id, %local, %peer, "tcp connection registered");
        Ok(connection)
    }

    pub(crate) fn dispatch(self: &Arc<Self>, token: Token, readiness: Readiness) {
        let id = ConnectionId::from_token(token.0);
        match self.entry(id) {
            Some(SocketEntry::Connection(connection)) => connection.ready(readiness),
            Some(SocketEntry::Listener(listener)) => listener.accept_pending(self),
            Some(SocketEntry::Connector(pending)) => pending.ready(self, id, readiness),
            None => tracing::trace!(token = token.0, "readiness for a released socket ignored"),
        }
    }

    fn count(&self, predicate: impl Fn(&SocketEntry) -> bool) -> usize {
        lock(&self.sockets)
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .count()
    }
}

/// 套接字后端的操作句柄，克隆代价为一次引用计数递增。
///
/// 所有方法都可以在调度线程上调用；结果回调经调度器投递。
#[derive(Clone)]
pub struct TcpNetwork {
    shared: Arc<NetworkShared>,
}

impl TcpNetwork {
    pub(crate) fn new(dispatcher: EventDispatcher, registry: mio::Registry, config: TcpConfig) -> Self {
        let limits = config.limits();
        let pool = SendBufferPool::new(limits.send_pool_chunks(), dispatcher.clone());
        Self {
            shared: Arc::new(NetworkShared {
                sockets: Mutex::new(Registry::with_capacity(limits.max_connections())),
                dispatcher,
                registry,
                config,
                pool,
            }),
        }
    }

    pub(crate) fn dispatch(&self, token: Token, readiness: Readiness) {
        self.shared.dispatch(token, readiness);
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }

    /// 所有连接共享的发送池。
    pub fn pool(&self) -> &SendBufferPool {
        &self.shared.pool
    }

    pub fn config(&self) -> &TcpConfig {
        &self.shared.config
    }

    /// 在 `address` 上监听；每条接受的连接交给 `factory` 挂接观察者。
    ///
    /// 端口为 0 时由内核分配，实际地址见 [`TcpListenerHandle::local_addr`]。
    pub fn listen(
        &self,
        address: SocketAddr,
        factory: Arc<dyn ServerConnectionObserverFactory>,
    ) -> Result<TcpListenerHandle, CoreError> {
        ListenerSocket::bind(&self.shared, address, factory)
    }

    /// 向 `factory.address()` 发起非阻塞连接。
    ///
    /// 结果经调度器回报给工厂；同步失败（地址不可用、注册表已满）同样以
    /// `connection_failed` 回报，此时返回 `None`。
    pub fn connect(&self, factory: Arc<dyn ClientConnectionObserverFactory>) -> Option<ConnectorId> {
        PendingConnect::start(&self.shared, factory)
    }

    /// 撤销尚未完成的连接；工厂不会再收到任何回调。返回是否确实撤销了连接。
    pub fn cancel_connect(&self, connector: ConnectorId) -> bool {
        PendingConnect::cancel(&self.shared, connector)
    }

    /// 注册表中存活的连接数（不含监听器与连接器）。
    pub fn live_connections(&self) -> usize {
        self.shared
            .count(|entry| matches!(entry, SocketEntry::Connection(_)))
    }

    /// 尚未完成的连接器数量。
    pub fn pending_connects(&self) -> usize {
        self.shared
            .count(|entry| matches!(entry, SocketEntry::Connector(_)))
    }
}

impl fmt::Debug for TcpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpNetwork")
            .field("connections", &self.live_connections())
            .field("pending_connects", &self.pending_connects())
            .field("pool", &self.shared.pool)
            .finish()
    }
}
