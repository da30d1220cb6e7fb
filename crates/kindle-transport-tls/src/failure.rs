//! TLS 失败分类与诊断钩子。
//!
//! # 设计定位（Why）
//! - 握手失败、记录层解密失败与输出失败对排障的意义不同，分别经独立钩子上报；
//! - 钩子只做观测，不参与恢复：任何 TLS 失败都终止连接，从不自动重试。

use std::io;
use std::net::SocketAddr;

use kindle_core::error::{CoreError, DisconnectReason, ErrorCategory, codes};

/// 失败所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// 会话创建或握手阶段。
    Init,
    /// 握手完成后的入站记录处理。
    Read,
    /// 明文写入或密文输出。
    Write,
}

/// TLS 层的终止性失败。
///
/// # 契约（What）
/// - [`kind`](Self::kind) 决定调用哪一个 [`TlsFailureHooks`] 方法；
/// - [`code`](Self::code) 与 `kindle_core::error::codes` 中的 `TLS_*` 对齐，随
///   [`DisconnectReason::TlsFailure`] 交给观察者。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TlsFailure {
    /// 服务器名不是合法的 DNS 名称或 IP 地址。
    #[error("invalid tls server name `{0}`")]
    InvalidServerName(String),
    /// 引擎拒绝创建会话或握手失败（证书不受信任、协议不匹配、收到告警等）。
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] rustls::Error),
    /// 握手完成后入站记录无法解密或违反协议。
    #[error("tls record layer rejected inbound data: {0}")]
    Read(#[source] rustls::Error),
    /// 明文无法交给引擎或密文无法写出。
    #[error("tls record output failed: {0}")]
    Write(io::ErrorKind),
}

impl TlsFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidServerName(_) | Self::Handshake(_) => FailureKind::Init,
            Self::Read(_) => FailureKind::Read,
            Self::Write(_) => FailureKind::Write,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self.kind() {
            FailureKind::Init => codes::TLS_INIT,
            FailureKind::Read => codes::TLS_READ,
            FailureKind::Write => codes::TLS_WRITE,
        }
    }

    /// 交给观察者的断开原因。
    pub fn disconnect_reason(&self) -> DisconnectReason {
        DisconnectReason::TlsFailure { code: self.code() }
    }
}

/// 归入 [`ErrorCategory::Security`]，原始失败作为 `source()` 保留。
impl From<TlsFailure> for CoreError {
    fn from(failure: TlsFailure) -> Self {
        CoreError::new(failure.code(), failure.to_string())
            .with_category(ErrorCategory::Security)
            .with_cause(failure)
    }
}

/// 失败诊断扩展点，默认实现全部为空操作。
///
/// 钩子在调度线程上、连接锁之外调用，可以安全地读取连接的公开信息，
/// 但不应在钩子内同步拆除连接：拆除已由 TLS 层安排在下一轮调度中进行。
pub trait TlsFailureHooks: Send + Sync + 'static {
    /// 会话创建或握手失败。
    fn tls_init_failure(&self, peer: Option<SocketAddr>, failure: &TlsFailure) {
        let _ = (peer, failure);
    }

    /// 记录层解密失败。
    fn tls_read_failure(&self, peer: Option<SocketAddr>, failure: &TlsFailure) {
        let _ = (peer, failure);
    }

    /// 明文写入或密文输出失败。
    fn tls_write_failure(&self, peer: Option<SocketAddr>, failure: &TlsFailure) {
        let _ = (peer, failure);
    }
}

/// 什么也不做的钩子。
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentFailureHooks;

impl TlsFailureHooks for SilentFailureHooks {}

/// 以 `tracing::warn!` 记录失败的钩子，上下文未指定钩子时的缺省选择。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFailureHooks;

impl TlsFailureHooks for TracingFailureHooks {
    fn tls_init_failure(&self, peer: Option<SocketAddr>, failure: &TlsFailure) {
        let err = CoreError::from(failure.clone());
        tracing::warn!(?peer, code = err.code(), category = ?err.category(), error = %err, "tls handshake failed");
    }

    fn tls_read_failure(&self, peer: Option<SocketAddr>, failure: &TlsFailure) {
        let err = CoreError::from(failure.clone());
        tracing::warn!(?peer, code = err.code(), category = ?err.category(), error = %err, "tls read failed");
    }

    fn tls_write_failure(&self, peer: Option<SocketAddr>, failure: &TlsFailure) {
        let err = CoreError::from(failure.clone());
        tracing::warn!(?peer, code = err.code(), category = ?err.category(), error = %err, "tls write failed");
    }
}

/// 按失败阶段分派到对应钩子。
pub(crate) fn report_failure(hooks: &dyn TlsFailureHooks, peer: Option<SocketAddr>, failure: &TlsFailure) {
    match failure.kind() {
        FailureKind::Init => hooks.tls_init_failure(peer, failure),
        FailureKind::Read => hooks.tls_read_failure(peer, failure),
        FailureKind::Write => hooks.tls_write_failure(peer, failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<FailureKind>>,
    }

    impl TlsFailureHooks for Collecting {
        fn tls_init_failure(&self, _peer: Option<SocketAddr>, failure: &TlsFailure) {
            self.seen.lock().expect("未中毒").push(failure.kind());
        }

        fn tls_write_failure(&self, _peer: Option<SocketAddr>, failure: &TlsFailure) {
            self.seen.lock().expect("未中毒").push(failure.kind());
        }
    }

    #[test]
    fn failures_map_to_stable_codes() {
        let handshake = TlsFailure::Handshake(rustls::Error::DecryptError);
        assert_eq!(handshake.code(), codes::TLS_INIT);
        assert_eq!(
            TlsFailure::Read(rustls::Error::DecryptError).disconnect_reason(),
            DisconnectReason::TlsFailure {
                code: codes::TLS_READ
            }
        );
        assert_eq!(
            TlsFailure::Write(io::ErrorKind::WriteZero).code(),
            codes::TLS_WRITE
        );
        assert_eq!(
            TlsFailure::InvalidServerName("bad name".into()).kind(),
            FailureKind::Init
        );
    }

    #[test]
    fn failures_convert_to_security_errors() {
        let err = CoreError::from(TlsFailure::Read(rustls::Error::DecryptError));
        assert_eq!(err.code(), codes::TLS_READ);
        assert_eq!(err.category(), ErrorCategory::Security);
        assert!(std::error::Error::source(&err).is_some(), "原始失败保留为 source");
    }

    #[test]
    fn report_routes_by_kind_and_skips_unimplemented_hooks() {
        let hooks = Collecting::default();
        report_failure(&hooks, None, &TlsFailure::Handshake(rustls::Error::DecryptError));
        report_failure(&hooks, None, &TlsFailure::Read(rustls::Error::DecryptError));
        report_failure(&hooks, None, &TlsFailure::Write(io::ErrorKind::BrokenPipe));
        assert_eq!(
            *hooks.seen.lock().expect("未中毒"),
            vec![FailureKind::Init, FailureKind::Write],
            "未覆盖的读失败钩子保持空操作"
        );
    }

    #[test]
    #[traced_test]
    fn tracing_hooks_log_the_failure_code() {
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 443)));
        report_failure(
            &TracingFailureHooks,
            peer,
            &TlsFailure::Handshake(rustls::Error::DecryptError),
        );
        assert!(logs_contain("tls handshake failed"));
        assert!(logs_contain(codes::TLS_INIT));
        assert!(logs_contain("Security"));
    }
}
