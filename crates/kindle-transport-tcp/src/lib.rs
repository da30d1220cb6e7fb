#![deny(unsafe_code)]
#![doc = r#"
kindle-transport-tcp: 基于 `mio` 的非阻塞套接字后端。

== 组成 ==
- [`TcpEventLoop`]：把 `mio::Poll` 接入为调度器的空闲策略，`mio::Waker` 充当跨线程唤醒器；
- [`TcpNetwork`]：监听、主动连接与撤销连接，持有套接字注册表与共享发送池；
- [`TcpConnection`]：连接契约的套接字实现，含接收窗口、短写续传、优雅关闭与 RST 中止；
- [`TcpSocketConfig`] / [`TcpConfig`]：套接字选项与后端容量配置。

== 线程模型 ==
所有套接字读写与观察者回调都发生在运行事件循环的线程上；
其它线程只能通过调度器推入动作，推入会打断正在阻塞的 `poll`。
"#]

mod config;
mod connection;
mod connector;
mod error;
mod event_loop;
mod listener;
mod network;

pub use config::{TcpConfig, TcpSocketConfig};
pub use connection::TcpConnection;
pub use connector::ConnectorId;
pub use event_loop::TcpEventLoop;
pub use listener::TcpListenerHandle;
pub use network::TcpNetwork;
