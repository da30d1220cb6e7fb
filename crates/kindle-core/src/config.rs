//! 构造期配置。
//!
//! 所有配置均为 `Copy` 的小结构体，通过 `with_*` 方法链式覆盖默认值；嵌入式目标通常在
//! `const` 上下文或启动代码中一次性确定，运行期不再修改。

/// 调度器配置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct DispatcherConfig {
    capacity: usize,
}

impl DispatcherConfig {
    /// 默认槽位数。
    pub const DEFAULT_CAPACITY: usize = 256;

    /// 以默认容量构造。
    pub const fn new() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
        }
    }

    /// 设置环形队列容量，必须按最坏情况下同时在途的动作数规划。
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// 环形队列容量。
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个传输后端实例的流控上限。
///
/// # 契约（What）
/// - `send_pool_chunks`：后端所有连接共享的发送块数量，耗尽后新的发送请求进入等待队列；
/// - `max_send_stream_size`：单次 `request_send_stream` 的上限；
/// - `receive_buffer_capacity`：每条连接的接收缓冲容量，写满后暂停从传输层读取；
/// - `max_connections`：注册表容量。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ConnectionLimits {
    send_pool_chunks: usize,
    max_send_stream_size: usize,
    receive_buffer_capacity: usize,
    max_connections: usize,
}

impl ConnectionLimits {
    /// 以默认值构造。
    pub const fn new() -> Self {
        Self {
            send_pool_chunks: 16,
            max_send_stream_size: 1460,
            receive_buffer_capacity: 4096,
            max_connections: 32,
        }
    }

    /// 设置发送池块数。
    pub const fn with_send_pool_chunks(mut self, chunks: usize) -> Self {
        self.send_pool_chunks = chunks;
        self
    }

    /// 设置单次发送流上限。
    pub const fn with_max_send_stream_size(mut self, size: usize) -> Self {
        self.max_send_stream_size = size;
        self
    }

    /// 设置接收缓冲容量。
    pub const fn with_receive_buffer_capacity(mut self, capacity: usize) -> Self {
        self.receive_buffer_capacity = capacity;
        self
    }

    /// 设置注册表容量。
    pub const fn with_max_connections(mut self, connections: usize) -> Self {
        self.max_connections = connections;
        self
    }

    pub const fn send_pool_chunks(&self) -> usize {
        self.send_pool_chunks
    }

    pub const fn max_send_stream_size(&self) -> usize {
        self.max_send_stream_size
    }

    pub const fn receive_buffer_capacity(&self) -> usize {
        self.receive_buffer_capacity
    }

    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new()
    }
}
