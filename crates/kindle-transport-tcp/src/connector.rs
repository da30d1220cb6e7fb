use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use kindle_core::factory::{ClientConnectionObserverFactory, ConnectFailReason, CreateObserver};
use kindle_core::registry::ConnectionId;
use kindle_core::sync::lock;
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::error::{self, connect_fail_reason, map_io_error};
use crate::event_loop::Readiness;
use crate::network::{NetworkShared, Registration, SocketEntry};

/// 进行中的主动连接标识，用于 [`TcpNetwork::cancel_connect`](crate::TcpNetwork::cancel_connect)。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectorId(ConnectionId);

/// 注册表中的连接器：非阻塞 `connect` 发出后等待可写事件判定结果。
///
/// # 逻辑（How）
/// - 可写或出错事件到达后先取 `SO_ERROR`，再以 `peer_addr` 区分“已连通”与“仍在握手”；
/// - 连通后以新令牌重新注册为连接，并在调度器上回报 `connection_established`；
/// - 失败时注销套接字并回报 `connection_failed`，`ECONNREFUSED` 单独归为 [`ConnectFailReason::Refused`]。
pub(crate) struct PendingConnect {
    stream: Mutex<Option<TcpStream>>,
    factory: Arc<dyn ClientConnectionObserverFactory>,
    target: SocketAddr,
}

enum Progress {
    Connecting,
    Connected,
    Failed(io::Error),
}

impl PendingConnect {
    pub(crate) fn start(
        network: &Arc<NetworkShared>,
        factory: Arc<dyn ClientConnectionObserverFactory>,
    ) -> Option<ConnectorId> {
        let target = factory.address();
        let mut stream = match TcpStream::connect(target) {
            Ok(stream) => stream,
            Err(err) => {
                let reason = connect_fail_reason(&err);
                let err = map_io_error(error::CONNECT, err);
                tracing::debug!(%target, error = %err, "tcp connect failed immediately");
                report_failure(network, factory, reason);
                return None;
            }
        };
        let pending = Arc::new(Self {
            stream: Mutex::new(None),
            factory: Arc::clone(&factory),
            target,
        });
        let id = match network.insert(SocketEntry::Connector(Arc::clone(&pending))) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(%target, error = %err, "tcp connect rejected");
                report_failure(network, factory, ConnectFailReason::AllocationFailed);
                return None;
            }
        };
        let interest = Interest::READABLE | Interest::WRITABLE;
        if let Err(err) = network
            .registry
            .register(&mut stream, Token(id.to_token()), interest)
        {
            network.release(id);
            let err = map_io_error(error::REGISTER, err);
            tracing::warn!(%target, error = %err, "tcp connect could not be registered");
            report_failure(network, factory, ConnectFailReason::AllocationFailed);
            return None;
        }
        *lock(&pending.stream) = Some(stream);
        tracing::debug!(%target, connector = ?id, "tcp connect started");
        Some(ConnectorId(id))
    }

    pub(crate) fn cancel(network: &Arc<NetworkShared>, connector: ConnectorId) -> bool {
        let Some(SocketEntry::Connector(pending)) = network.entry(connector.0) else {
            return false;
        };
        if let Some(mut stream) = lock(&pending.stream).take() {
            if let Err(err) = network.registry.deregister(&mut stream) {
                tracing::trace!(error = %err, "tcp connector deregister failed");
            }
        }
        network.release(connector.0);
        tracing::debug!(target = %pending.target, "tcp connect cancelled");
        true
    }

    pub(crate) fn ready(&self, network: &Arc<NetworkShared>, id: ConnectionId, readiness: Readiness) {
        if !(readiness.writable || readiness.error || readiness.read_closed) {
            return;
        }
        let mut guard = lock(&self.stream);
        let Some(stream) = guard.as_ref() else {
            return;
        };
        let progress = match stream.take_error() {
            Ok(Some(err)) | Err(err) => Progress::Failed(err),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Progress::Connected,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => Progress::Connecting,
                Err(err) => Progress::Failed(err),
            },
        };
        let stream = match progress {
            Progress::Connecting => return,
            Progress::Connected | Progress::Failed(_) => guard.take(),
        };
        drop(guard);
        network.release(id);
        let Some(mut stream) = stream else {
            return;
        };

        match progress {
            Progress::Connected => match network.adopt(stream, self.target, Registration::Existing) {
                Ok(connection) => {
                    tracing::debug!(target = %self.target, "tcp connect established");
                    let factory = Arc::clone(&self.factory);
                    network.dispatcher.schedule(move || {
                        factory.connection_established(CreateObserver::new(connection));
                    });
                }
                Err(err) => {
                    tracing::warn!(target = %self.target, error = %err, "tcp connect could not adopt stream");
                    report_failure(network, Arc::clone(&self.factory), ConnectFailReason::AllocationFailed);
                }
            },
            Progress::Failed(err) => {
                if let Err(deregister) = network.registry.deregister(&mut stream) {
                    tracing::trace!(error = %deregister, "tcp connector deregister failed");
                }
                let reason = connect_fail_reason(&err);
                let err = map_io_error(error::CONNECT, err);
                tracing::debug!(target = %self.target, error = %err, "tcp connect failed");
                report_failure(network, Arc::clone(&self.factory), reason);
            }
            Progress::Connecting => {}
        }
    }
}

fn report_failure(
    network: &NetworkShared,
    factory: Arc<dyn ClientConnectionObserverFactory>,
    reason: ConnectFailReason,
) {
    network
        .dispatcher
        .schedule(move || factory.connection_failed(reason));
}

impl fmt::Debug for PendingConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnect")
            .field("target", &self.target)
            .finish()
    }
}
