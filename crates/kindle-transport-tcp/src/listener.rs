use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use kindle_core::error::CoreError;
use kindle_core::factory::{CreateObserver, ServerConnectionObserverFactory};
use kindle_core::registry::ConnectionId;
use kindle_core::sync::lock;
use mio::net::TcpListener;
use mio::{Interest, Token};

use crate::error::{self, map_io_error};
use crate::network::{NetworkShared, Registration, SocketEntry};

/// 注册表中的监听套接字。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“接受 → 注册 → 交给工厂挂接观察者”收敛到一处，工厂无需接触 `mio` 类型；
/// - 工厂回调经调度器投递，与回环后端保持相同的异步时序。
///
/// ## 逻辑 (How)
/// - 可读事件到达后循环 `accept` 直到 `WouldBlock`（边沿触发必须排空）；
/// - 每条新连接先应用 [`TcpSocketConfig`](crate::TcpSocketConfig) 并纳入注册表，
///   再把 [`CreateObserver`] 交给工厂；工厂丢弃它即中止连接。
///
/// ## 注意事项 (Trade-offs)
/// - 注册表已满时新连接被立即关闭，监听器继续工作；
/// - 非 `WouldBlock` 的 `accept` 错误（如文件描述符耗尽）只记录日志并结束本轮，等待下一次就绪事件。
pub(crate) struct ListenerSocket {
    listener: Mutex<Option<TcpListener>>,
    factory: Arc<dyn ServerConnectionObserverFactory>,
    local: SocketAddr,
}

impl ListenerSocket {
    pub(crate) fn bind(
        network: &Arc<NetworkShared>,
        address: SocketAddr,
        factory: Arc<dyn ServerConnectionObserverFactory>,
    ) -> Result<TcpListenerHandle, CoreError> {
        let mut listener =
            TcpListener::bind(address).map_err(|err| map_io_error(error::BIND, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let socket = Arc::new(Self {
            listener: Mutex::new(None),
            factory,
            local,
        });
        let id = network.insert(SocketEntry::Listener(Arc::clone(&socket)))?;
        if let Err(err) = network
            .registry
            .register(&mut listener, Token(id.to_token()), Interest::READABLE)
        {
            network.release(id);
            return Err(map_io_error(error::REGISTER, err));
        }
        *lock(&socket.listener) = Some(listener);
        tracing::info!(%local, "tcp listener started");
        Ok(TcpListenerHandle {
            network: Arc::downgrade(network),
            id,
            local,
        })
    }

    pub(crate) fn accept_pending(&self, network: &Arc<NetworkShared>) {
        loop {
            let accepted = {
                let guard = lock(&self.listener);
                let Some(listener) = guard.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => self.adopt(network, stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let err = map_io_error(error::ACCEPT, err);
                    tracing::warn!(local = %self.local, error = %err, "tcp accept failed");
                    return;
                }
            }
        }
    }

    fn adopt(&self, network: &Arc<NetworkShared>, stream: mio::net::TcpStream, peer: SocketAddr) {
        match network.adopt(stream, peer, Registration::Fresh) {
            Ok(connection) => {
                tracing::debug!(local = %self.local, %peer, "tcp connection accepted");
                let factory = Arc::clone(&self.factory);
                network.dispatcher.schedule(move || {
                    factory.connection_accepted(CreateObserver::new(connection), peer);
                });
            }
            Err(err) => {
                tracing::warn!(local = %self.local, %peer, error = %err, "tcp connection dropped on accept");
            }
        }
    }

    fn close(&self, network: &NetworkShared) {
        let listener = lock(&self.listener).take();
        if let Some(mut listener) = listener {
            if let Err(err) = network.registry.deregister(&mut listener) {
                tracing::trace!(error = %err, "tcp listener deregister failed");
            }
        }
    }
}

/// 监听句柄；释放时停止监听并关闭监听套接字，已接受的连接不受影响。
pub struct TcpListenerHandle {
    network: Weak<NetworkShared>,
    id: ConnectionId,
    local: SocketAddr,
}

impl TcpListenerHandle {
    /// 实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for TcpListenerHandle {
    fn drop(&mut self) {
        if let Some(network) = self.network.upgrade() {
            network.close_listener(self.id);
            tracing::info!(local = %self.local, "tcp listener stopped");
        }
    }
}

impl fmt::Debug for TcpListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListenerHandle")
            .field("id", &self.id)
            .field("local", &self.local)
            .finish()
    }
}

impl NetworkShared {
    fn close_listener(&self, id: ConnectionId) {
        if let Some(SocketEntry::Listener(socket)) = self.entry(id) {
            socket.close(self);
        }
        self.release(id);
    }
}
