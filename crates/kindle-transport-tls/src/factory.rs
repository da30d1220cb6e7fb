//! 观察者工厂的 TLS 包装：原始连接被接受或建立后先套上 TLS 层，再交给应用工厂。

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use kindle_core::connection::ConnectionObserver;
use kindle_core::factory::{
    ClientConnectionObserverFactory, ConnectFailReason, CreateObserver,
    ServerConnectionObserverFactory,
};

use crate::context::{TlsClientContext, TlsServerContext};

/// 服务端工厂包装。
///
/// 应用工厂拿到的 [`CreateObserver`] 指向 TLS 连接；拒绝或丢弃它会连同原始连接一起中止。
pub struct TlsServerFactory {
    context: TlsServerContext,
    inner: Arc<dyn ServerConnectionObserverFactory>,
}

impl TlsServerFactory {
    pub fn new(context: TlsServerContext, inner: Arc<dyn ServerConnectionObserverFactory>) -> Arc<Self> {
        Arc::new(Self { context, inner })
    }
}

impl ServerConnectionObserverFactory for TlsServerFactory {
    fn connection_accepted(&self, create_observer: CreateObserver, peer: SocketAddr) {
        let tls = match self.context.create() {
            Ok(tls) => tls,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "tls session unavailable; declining connection");
                create_observer.decline();
                return;
            }
        };
        create_observer.attach(Arc::clone(&tls) as Arc<dyn ConnectionObserver>);
        self.inner.connection_accepted(CreateObserver::new(tls), peer);
    }
}

impl fmt::Debug for TlsServerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerFactory")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// 客户端工厂包装：连接目标取自应用工厂，`server_name` 用于证书校验与会话缓存。
pub struct TlsClientFactory {
    context: TlsClientContext,
    server_name: String,
    inner: Arc<dyn ClientConnectionObserverFactory>,
}

impl TlsClientFactory {
    pub fn new(
        context: TlsClientContext,
        server_name: impl Into<String>,
        inner: Arc<dyn ClientConnectionObserverFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            server_name: server_name.into(),
            inner,
        })
    }
}

impl ClientConnectionObserverFactory for TlsClientFactory {
    fn address(&self) -> SocketAddr {
        self.inner.address()
    }

    fn connection_established(&self, create_observer: CreateObserver) {
        match self.context.create(&self.server_name) {
            Ok(tls) => {
                create_observer.attach(Arc::clone(&tls) as Arc<dyn ConnectionObserver>);
                self.inner.connection_established(CreateObserver::new(tls));
            }
            Err(err) => {
                create_observer.decline();
                self.inner
                    .connection_failed(ConnectFailReason::Failed { code: err.code() });
            }
        }
    }

    fn connection_failed(&self, reason: ConnectFailReason) {
        self.inner.connection_failed(reason);
    }
}

impl fmt::Debug for TlsClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientFactory")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
