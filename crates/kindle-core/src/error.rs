//! 内核统一错误模型与断开原因。
//!
//! # 设计定位（Why）
//! - 连接契约中大部分失败是“终止连接、不终止进程”，需要一个可在调度器、传输层与 TLS 层之间传递的稳定错误载体；
//! - 契约违背（重复申请发送流、队列溢出）不走错误通道，而是直接 `panic!`，此处只描述可恢复或终止连接的失败。
//!
//! # 契约说明（What）
//! - [`CoreError`] 携带 `<领域>.<语义>` 形式的稳定错误码、可读消息与 [`ErrorCategory`]；
//! - [`DisconnectReason`] 随 `closing_connection` 回调交给观察者，填补“观察者只能从沉默中推断失败”的空白。

use alloc::borrow::Cow;
use alloc::boxed::Box;
use core::error::Error;
use core::fmt;

/// 稳定错误码表。
///
/// 错误码一经发布不得修改语义；新增码值需同步更新 DESIGN.md 中的错误表。
pub mod codes {
    /// 注册表已满，无法接纳新的连接或监听器。
    pub const REGISTRY_FULL: &str = "kindle.registry.full";
    /// 本地端口或地址上已存在监听器。
    pub const LISTENER_EXISTS: &str = "kindle.listener.exists";
    /// 目标地址没有监听器或对端拒绝连接。
    pub const CONNECT_REFUSED: &str = "kindle.connect.refused";
    /// 传输层读取失败。
    pub const TRANSPORT_READ: &str = "kindle.transport.read";
    /// 传输层写入失败。
    pub const TRANSPORT_WRITE: &str = "kindle.transport.write";
    /// 套接字绑定、监听或选项配置失败。
    pub const TRANSPORT_SETUP: &str = "kindle.transport.setup";
    /// 事件循环轮询失败。
    pub const TRANSPORT_POLL: &str = "kindle.transport.poll";
    /// 远端重置连接。
    pub const PEER_RESET: &str = "kindle.peer.reset";
    /// 远端有序关闭。
    pub const PEER_CLOSED: &str = "kindle.peer.closed";
    /// TLS 会话初始化或握手失败。
    pub const TLS_INIT: &str = "kindle.tls.init";
    /// TLS 记录层解密失败。
    pub const TLS_READ: &str = "kindle.tls.read";
    /// TLS 记录层加密或输出失败。
    pub const TLS_WRITE: &str = "kindle.tls.write";
    /// 服务端工厂拒绝为新连接提供观察者。
    pub const FACTORY_DECLINED: &str = "kindle.factory.declined";
}

/// 错误分类，决定调用方应当重试、等待还是放弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[non_exhaustive]
pub enum ErrorCategory {
    /// 瞬时失败，可由上层择机重试（如被信号打断的系统调用）。
    Retryable,
    /// 背压：发送缓冲或发送池耗尽，连接内部会排队重试，不应暴露给观察者。
    Backpressure,
    /// 终止当前连接，但不影响进程。
    Terminal,
    /// TLS 等安全相关失败。
    Security,
}

/// 底层原因的装箱形式。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 内核统一错误。
///
/// # 契约定义（What）
/// - `code`：来自 [`codes`] 的稳定错误码；
/// - `message`：面向排障人员的描述，不含敏感信息；
/// - `category`：缺省为 [`ErrorCategory::Terminal`]，可通过 [`with_category`](Self::with_category) 覆盖。
///
/// # 示例
/// ```rust
/// use kindle_core::error::{codes, CoreError, ErrorCategory};
///
/// let err = CoreError::new(codes::TRANSPORT_READ, "socket read failed")
///     .with_category(ErrorCategory::Retryable);
/// assert_eq!(err.code(), codes::TRANSPORT_READ);
/// assert_eq!(err.category(), ErrorCategory::Retryable);
/// ```
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 以错误码与描述构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            category: ErrorCategory::Terminal,
            cause: None,
        }
    }

    /// 覆盖错误分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 附加底层原因，`source()` 会返回它。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 底层原因（若存在）。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// 连接被拆除的原因。
///
/// # 意图（Why）
/// - 传输层失败（对端重置、套接字错误）若只表现为“观察者不再收到回调”，上层无法区分优雅关闭与故障；
/// - 由注册表移除连接时携带原因码，经 `closing_connection` 告知观察者，随后必定跟随 `detached`。
///
/// # 契约（What）
/// - 仅用于“非观察者发起”的拆除；观察者自己调用 `close`/`abort` 时只会收到 `detached`；
/// - [`code`](Self::code) 返回与 [`codes`] 对齐的稳定字符串，便于日志聚合。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// 对端有序关闭（FIN 或 TLS `close_notify`）。
    PeerClosed,
    /// 对端重置或本地中止导致的对端视角断开。
    PeerReset,
    /// 传输层错误，`code` 指向具体的 I/O 失败类别。
    TransportFailure { code: &'static str },
    /// TLS 握手或记录层失败。
    TlsFailure { code: &'static str },
    /// 工厂拒绝为新连接提供观察者。
    Declined,
}

impl DisconnectReason {
    /// 稳定原因码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::PeerClosed => codes::PEER_CLOSED,
            Self::PeerReset => codes::PEER_RESET,
            Self::TransportFailure { code } | Self::TlsFailure { code } => code,
            Self::Declined => codes::FACTORY_DECLINED,
        }
    }

    /// 是否属于有序关闭。
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
