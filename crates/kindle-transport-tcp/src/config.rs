use std::io;
use std::time::Duration;

use kindle_core::config::{ConnectionLimits, DispatcherConfig};
use mio::net::TcpStream;
use socket2::SockRef;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“优雅关闭是否等待发送缓冲排空”与“是否关闭 Nagle 合并”显式配置化，
///   避免调用方直接操作 `socket2` 或平台相关常量；
/// - 监听器接受的连接与连接器建立的连接共用同一份配置，关闭时序保持一致。
///
/// ## 核心逻辑（How）
/// - `linger` 为 `Some(dur)` 时，通过 `socket2::SockRef::set_linger` 设置 `SO_LINGER`；
///   `None` 表示遵循内核默认策略；
/// - `nodelay` 直接映射为 `TCP_NODELAY`。
///
/// ## 注意事项（Trade-offs）
/// - 中止连接时无论此处如何配置都会临时设置 `SO_LINGER=0`，以发送 RST 代替 FIN；
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl TcpSocketConfig {
    /// 默认配置：`linger = None`，开启 `TCP_NODELAY`。
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub const fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub const fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub const fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub const fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 套接字后端的整体配置。
///
/// # 契约（What）
/// - `limits`：发送池块数、单次发送上限、接收缓冲与注册表容量；
/// - `dispatcher`：调度器容量，应覆盖“每条连接最多若干个在途动作”的峰值；
/// - `poll_timeout`：调度器空闲时单次 `poll` 的最长阻塞，兼作 `run_while` 检查退出条件的节拍；
/// - `events_capacity`：单次 `poll` 最多取回的就绪事件数。
#[derive(Clone, Copy, Debug)]
pub struct TcpConfig {
    limits: ConnectionLimits,
    dispatcher: DispatcherConfig,
    socket: TcpSocketConfig,
    poll_timeout: Option<Duration>,
    events_capacity: usize,
}

impl TcpConfig {
    /// 默认轮询节拍。
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);
    /// 默认单次事件批量。
    pub const DEFAULT_EVENTS_CAPACITY: usize = 128;

    pub const fn new() -> Self {
        Self {
            limits: ConnectionLimits::new(),
            dispatcher: DispatcherConfig::new(),
            socket: TcpSocketConfig::new(),
            poll_timeout: Some(Self::DEFAULT_POLL_TIMEOUT),
            events_capacity: Self::DEFAULT_EVENTS_CAPACITY,
        }
    }

    pub const fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub const fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub const fn with_socket(mut self, socket: TcpSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    /// `None` 表示无新事件时一直阻塞。
    pub const fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub const fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub const fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    pub const fn dispatcher(&self) -> &DispatcherConfig {
        &self.dispatcher
    }

    pub const fn socket(&self) -> &TcpSocketConfig {
        &self.socket
    }

    pub const fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout
    }

    pub const fn events_capacity(&self) -> usize {
        self.events_capacity
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new()
    }
}
