use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kindle_core::connection::{Connection, ConnectionObserver};
use kindle_core::dispatcher::EventDispatcher;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::config::TlsConfig;
use crate::connection::{SessionBinding, TlsConnection};
use crate::engine::Engine;
use crate::failure::{TlsFailure, TlsFailureHooks, TracingFailureHooks, report_failure};
use crate::session_cache::{ClientSessionCache, SessionKey};

/// 客户端 TLS 上下文：按目标复用会话，为原始连接套上客户端 TLS 层。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“基础配置 + 会话缓存 + 失败钩子”收敛为一个可克隆的句柄，应用只需给出服务器名；
///
/// ## 契约 (What)
/// - [`create`](Self::create) 只构造 TLS 连接，不挂接；[`wrap`](Self::wrap) 额外把它挂接为原始连接的观察者；
/// - 服务器名非法或引擎拒绝创建会话时返回 [`TlsFailure`]，同时调用 `tls_init_failure` 钩子。
#[derive(Clone)]
pub struct TlsClientContext {
    dispatcher: EventDispatcher,
    sessions: ClientSessionCache,
    hooks: Arc<dyn TlsFailureHooks>,
    config: TlsConfig,
}

impl TlsClientContext {
    pub fn new(dispatcher: EventDispatcher, base: Arc<ClientConfig>, config: TlsConfig) -> Self {
        let sessions = ClientSessionCache::new(
            base,
            config.session_cache_capacity(),
            config.sessions_per_key(),
        );
        Self {
            dispatcher,
            sessions,
            hooks: Arc::new(TracingFailureHooks),
            config,
        }
    }

    /// 替换失败钩子。
    pub fn with_hooks(mut self, hooks: Arc<dyn TlsFailureHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn sessions(&self) -> &ClientSessionCache {
        &self.sessions
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// 为服务器 `host`（DNS 名称或 IP 地址）构造客户端 TLS 连接。
    pub fn create(&self, host: &str) -> Result<Arc<TlsConnection>, TlsFailure> {
        let key = SessionKey::for_host(host);
        let engine = ServerName::try_from(host)
            .map_err(|_| TlsFailure::InvalidServerName(host.to_owned()))
            .and_then(|name| {
                ClientConnection::new(self.sessions.config_for(&key), name.to_owned())
                    .map_err(TlsFailure::Handshake)
            });
        let engine = match engine {
            Ok(engine) => engine,
            Err(failure) => {
                report_failure(self.hooks.as_ref(), None, &failure);
                self.sessions.invalidate(&key);
                return Err(failure);
            }
        };
        tracing::debug!(%key, "tls client session created");
        Ok(TlsConnection::new(
            self.dispatcher.clone(),
            Engine::Client(engine),
            &self.config,
            Arc::clone(&self.hooks),
            Some(SessionBinding {
                cache: self.sessions.clone(),
                key,
            }),
        ))
    }

    /// 构造客户端 TLS 连接并挂接到 `raw` 上。
    pub fn wrap(&self, raw: &Arc<dyn Connection>, host: &str) -> Result<Arc<TlsConnection>, TlsFailure> {
        let tls = self.create(host)?;
        raw.attach(Arc::clone(&tls) as Arc<dyn ConnectionObserver>);
        Ok(tls)
    }
}

impl fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientContext")
            .field("sessions", &self.sessions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// 服务端 TLS 上下文，支持证书热更新。
///
/// # 设计动机（Why）
/// - 证书轮换不应要求重建监听器：配置保存在 `ArcSwap` 中，读路径无锁；
/// - 每条新连接在创建时读取一次快照，已建立的连接继续持有旧配置。
///
/// # 契约（What）
/// - [`replace_config`](Self::replace_config) 立即对后续 [`create`](Self::create) 可见，并返回旧配置；
/// - 克隆得到的句柄共享同一个热更容器。
#[derive(Clone)]
pub struct TlsServerContext {
    dispatcher: EventDispatcher,
    server_config: Arc<ArcSwap<ServerConfig>>,
    hooks: Arc<dyn TlsFailureHooks>,
    config: TlsConfig,
}

impl TlsServerContext {
    pub fn new(dispatcher: EventDispatcher, server_config: Arc<ServerConfig>, config: TlsConfig) -> Self {
        Self {
            dispatcher,
            server_config: Arc::new(ArcSwap::new(server_config)),
            hooks: Arc::new(TracingFailureHooks),
            config,
        }
    }

    /// 替换失败钩子。
    pub fn with_hooks(mut self, hooks: Arc<dyn TlsFailureHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// 当前服务端配置的快照。
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.server_config.load_full()
    }

    /// 原子替换服务端配置，返回被替换的旧配置。
    pub fn replace_config(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        tracing::info!("tls server config replaced");
        self.server_config.swap(next)
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// 以当前配置快照构造服务端 TLS 连接。
    pub fn create(&self) -> Result<Arc<TlsConnection>, TlsFailure> {
        let engine = match ServerConnection::new(self.snapshot()) {
            Ok(engine) => engine,
            Err(err) => {
                let failure = TlsFailure::Handshake(err);
                report_failure(self.hooks.as_ref(), None, &failure);
                return Err(failure);
            }
        };
        Ok(TlsConnection::new(
            self.dispatcher.clone(),
            Engine::Server(engine),
            &self.config,
            Arc::clone(&self.hooks),
            None,
        ))
    }

    /// 构造服务端 TLS 连接并挂接到 `raw` 上。
    pub fn wrap(&self, raw: &Arc<dyn Connection>) -> Result<Arc<TlsConnection>, TlsFailure> {
        let tls = self.create()?;
        raw.attach(Arc::clone(&tls) as Arc<dyn ConnectionObserver>);
        Ok(tls)
    }
}

impl fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
