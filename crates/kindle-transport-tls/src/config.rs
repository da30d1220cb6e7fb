/// TLS 装饰器的容量配置。
///
/// # 契约（What）
/// - `plaintext_receive_capacity`：每条 TLS 连接解密后明文的缓冲上限，写满后暂停消费底层密文；
/// - `max_plaintext_send`：观察者单次可请求的明文发送流上限；
/// - `session_cache_capacity`：客户端会话缓存保留的目标数（主机名或地址）；
/// - `sessions_per_key`：每个目标保留的会话票据数量。
///
/// # 示例
/// ```rust
/// use kindle_transport_tls::TlsConfig;
///
/// let config = TlsConfig::new().with_max_plaintext_send(1024);
/// assert_eq!(config.max_plaintext_send(), 1024);
/// assert_eq!(config.plaintext_receive_capacity(), 4096);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    plaintext_receive_capacity: usize,
    max_plaintext_send: usize,
    session_cache_capacity: usize,
    sessions_per_key: usize,
}

impl TlsConfig {
    pub const fn new() -> Self {
        Self {
            plaintext_receive_capacity: 4096,
            max_plaintext_send: 4096,
            session_cache_capacity: 16,
            sessions_per_key: 4,
        }
    }

    pub const fn with_plaintext_receive_capacity(mut self, capacity: usize) -> Self {
        self.plaintext_receive_capacity = capacity;
        self
    }

    pub const fn with_max_plaintext_send(mut self, size: usize) -> Self {
        self.max_plaintext_send = size;
        self
    }

    pub const fn with_session_cache_capacity(mut self, capacity: usize) -> Self {
        self.session_cache_capacity = capacity;
        self
    }

    pub const fn with_sessions_per_key(mut self, sessions: usize) -> Self {
        self.sessions_per_key = sessions;
        self
    }

    pub const fn plaintext_receive_capacity(&self) -> usize {
        self.plaintext_receive_capacity
    }

    pub const fn max_plaintext_send(&self) -> usize {
        self.max_plaintext_send
    }

    pub const fn session_cache_capacity(&self) -> usize {
        self.session_cache_capacity
    }

    pub const fn sessions_per_key(&self) -> usize {
        self.sessions_per_key
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new()
    }
}
