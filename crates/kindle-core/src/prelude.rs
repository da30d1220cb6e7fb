//! 常用类型一次性导入：`use kindle_core::prelude::*;`

pub use crate::config::{ConnectionLimits, DispatcherConfig};
pub use crate::connection::{Connection, ConnectionObserver, Subject, SubjectSlot};
pub use crate::dispatcher::{EventDispatcher, ExecutionWaker, IdleStrategy};
pub use crate::error::{CoreError, DisconnectReason};
pub use crate::factory::{
    ClientConnectionObserverFactory, ConnectFailReason, CreateObserver,
    ServerConnectionObserverFactory,
};
pub use crate::stream::{ReceiveStream, SendStream};
