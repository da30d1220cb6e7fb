//! 发送流与接收流：一次性、独占的作用域缓冲对象。
//!
//! # 设计定位（Why）
//! - 发送流（[`SendStream`]）在 `send_stream_available` 中交给观察者，写完后随 `Drop` 把字节提交给连接；
//! - 接收流（[`ReceiveStream`]）是未确认入站字节的可回绕只读视图，读了多少由共享游标报告给连接，
//!   `ack_received` 只释放实际读过的部分；
//! - [`StreamGate`] 把“同一时刻最多一个未完成的发送流”显式编码为状态，违背时 `panic!`；
//!   接收侧的单读者约束见 [`crate::flow::ReceiveSide`]。

mod gate;
mod receive;
mod send;

pub use gate::{SendPhase, StreamGate};
pub use receive::{ReadCursor, ReceiveStream};
pub use send::SendStream;

/// 流操作的错误回报，取代字节流库中的“错误策略”旁路。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// 写入超过剩余容量，未写入任何字节。
    #[error("stream overflow: requested {requested} bytes but only {available} available")]
    Overflow { requested: usize, available: usize },
    /// 读取超过剩余数据，未消费任何字节。
    #[error("stream underflow: requested {requested} bytes but only {available} available")]
    Underflow { requested: usize, available: usize },
    /// 回绕或覆写使用了越界的标记。
    #[error("stream marker {marker} is outside the written range {limit}")]
    InvalidMarker { marker: usize, limit: usize },
}
