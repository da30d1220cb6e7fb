//! 流控缓冲：有界接收缓冲、共享发送池与待发队列，以及各后端共用的收发两侧簿记。
//!
//! # 背景（Why）
//! - 嵌入式目标要求内存上限可预测：接收缓冲写满即停止从传输层读取，发送池耗尽即排队等待；
//! - 背压只在连接内部体现为“稍后重试”，从不以错误形式暴露给观察者。

mod outgoing;
mod pool;
mod receive_buffer;
mod receive_side;
mod send_side;

pub use outgoing::{OutgoingChunk, OutgoingQueue};
pub use pool::{PoolPermit, SendBufferPool, WaiterId};
pub use receive_buffer::ReceiveBuffer;
pub use receive_side::ReceiveSide;
pub use send_side::{Reservation, SendSide};
