//! 观察者工厂：新建立的原始连接如何异步获得（或被拒绝）应用层观察者。

use alloc::sync::Arc;
use core::fmt;
use core::net::SocketAddr;

use crate::connection::{Connection, ConnectionObserver};
use crate::error::codes;

/// 一次性的观察者挂接回调。
///
/// 工厂可以立即或稍后调用 [`attach`](Self::attach)；调用 [`decline`](Self::decline)
/// 或直接丢弃本对象都视为拒绝，原始连接随即被中止。
pub struct CreateObserver {
    connection: Option<Arc<dyn Connection>>,
}

impl CreateObserver {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    /// 为连接挂接观察者。
    pub fn attach(mut self, observer: Arc<dyn ConnectionObserver>) {
        if let Some(connection) = self.connection.take() {
            connection.attach(observer);
        }
    }

    /// 拒绝连接。
    pub fn decline(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort_and_destroy();
        }
    }

    /// 待挂接的连接。
    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }
}

impl Drop for CreateObserver {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::debug!("observer creation dropped without attach; aborting connection");
            connection.abort_and_destroy();
        }
    }
}

impl fmt::Debug for CreateObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateObserver")
            .field("pending", &self.connection.is_some())
            .finish()
    }
}

/// 服务端工厂：监听器接受连接后调用。
pub trait ServerConnectionObserverFactory: Send + Sync + 'static {
    fn connection_accepted(&self, create_observer: CreateObserver, peer: SocketAddr);
}

/// 主动连接失败的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectFailReason {
    /// 对端拒绝或无监听者。
    Refused,
    /// 本地资源（注册表、套接字）不足。
    AllocationFailed,
    /// 其它传输错误。
    Failed { code: &'static str },
}

impl ConnectFailReason {
    /// 稳定错误码，与 [`codes`] 对齐。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Refused => codes::CONNECT_REFUSED,
            Self::AllocationFailed => codes::REGISTRY_FULL,
            Self::Failed { code } => code,
        }
    }
}

/// 客户端工厂：描述目标并接收连接结果。
pub trait ClientConnectionObserverFactory: Send + Sync + 'static {
    /// 目标地址与端口。
    fn address(&self) -> SocketAddr;

    /// 连接建立，工厂借此挂接观察者。
    fn connection_established(&self, create_observer: CreateObserver);

    /// 连接失败。
    fn connection_failed(&self, reason: ConnectFailReason);
}
