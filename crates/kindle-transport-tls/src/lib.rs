#![deny(unsafe_code)]
#![doc = r#"
kindle-transport-tls: 以 `rustls` 无 I/O 引擎包装任意连接的 TLS 装饰器。

== 组成 ==
- [`TlsConnection`]：同时实现 `ConnectionObserver`（面向底层）与 `Connection`（面向应用），
  握手、加解密与 `close_notify` 对应用透明；
- [`TlsClientContext`] / [`TlsServerContext`]：构造并挂接 TLS 连接，服务端配置可热更新；
- [`TlsClientFactory`] / [`TlsServerFactory`]：包装应用工厂，让监听器或连接器产出的原始连接自动获得 TLS 层；
- [`ClientSessionCache`]：按目标保留会话票据的有界 LRU，握手失败时整体失效；
- [`TlsFailureHooks`]：握手、读、写三类失败的诊断扩展点。

== 线程模型 ==
与底层传输相同：所有回调在调度线程上执行，TLS 层自身的回调也一律经调度器投递。
"#]

mod config;
mod connection;
mod context;
mod engine;
mod factory;
mod failure;
mod session_cache;

pub use config::TlsConfig;
pub use connection::{TlsConnection, TlsPhase};
pub use context::{TlsClientContext, TlsServerContext};
pub use factory::{TlsClientFactory, TlsServerFactory};
pub use failure::{FailureKind, SilentFailureHooks, TlsFailure, TlsFailureHooks, TracingFailureHooks};
pub use session_cache::{ClientSessionCache, SessionKey};
