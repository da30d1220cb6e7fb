use kindle_core::error::{CoreError, DisconnectReason, ErrorCategory, codes};
use kindle_core::factory::ConnectFailReason;
use std::borrow::Cow;
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: codes::TRANSPORT_SETUP,
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: codes::TRANSPORT_SETUP,
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: codes::TRANSPORT_SETUP,
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: codes::TRANSPORT_READ,
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::TRANSPORT_WRITE,
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: codes::TRANSPORT_WRITE,
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: codes::TRANSPORT_SETUP,
    message: "tcp configure",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: codes::TRANSPORT_POLL,
    message: "tcp register",
};
pub(crate) const POLL: OperationKind = OperationKind {
    code: codes::TRANSPORT_POLL,
    message: "tcp poll",
};

/// 将 IO 错误映射为内核级 CoreError，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(kind.code, Cow::Owned(format!("{}: {}", kind.message, error)))
        .with_category(category)
        .with_cause(error)
}

/// 读写失败时交给观察者的断开原因：对端重置类错误归为 `PeerReset`，其余保留操作码。
pub(crate) fn disconnect_reason(kind: OperationKind, error: &io::Error) -> DisconnectReason {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            DisconnectReason::PeerReset
        }
        _ => DisconnectReason::TransportFailure { code: kind.code },
    }
}

/// 主动连接失败时交给客户端工厂的原因。
pub(crate) fn connect_fail_reason(error: &io::Error) -> ConnectFailReason {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => ConnectFailReason::Refused,
        _ => ConnectFailReason::Failed {
            code: CONNECT.code,
        },
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => {
            ErrorCategory::Retryable
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::OutOfMemory => ErrorCategory::Backpressure,
        _ => ErrorCategory::Terminal,
    }
}
