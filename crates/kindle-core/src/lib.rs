#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![doc = r#"
kindle-core: 嵌入式事件驱动网络内核。

== 组成 ==
- `dispatcher`：协作式单线程调度器，推入端为无锁 CAS 定长环，支持弱绑定调度；
- `connection`：`Connection` / `ConnectionObserver` 契约与挂接纪律；
- `stream`：一次性发送流与可回绕接收流，以及单一未完成流的显式状态；
- `flow`：有界接收缓冲、共享发送池与待发队列；
- `registry`：带代际校验的连接注册表，取代“对象持有自身强引用”的存活期管理；
- `factory`：服务端/客户端观察者工厂；
- `loopback`：完整实现契约的内存回环替身；
- `sync`：原子与锁的统一出口，`std` 下另提供容忍中毒的互斥锁获取。

== 内存分配依赖 ==
本 crate 定位于 `no_std + alloc`：动作、观察者与缓冲使用 `Box`/`Arc`/`Vec`，
容量均在构造期固定，运行期不会超出配置的上限。`std` Feature 额外提供
`ThreadParker`、`std::io` 适配与 [`sync::lock`]。
"#]

extern crate alloc;

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod flow;
pub mod loopback;
pub mod prelude;
pub mod registry;
pub mod stream;
pub mod sync;
/// 测试桩命名空间，集中提供记录型观察者与工厂，供各传输 crate 的集成测试复用。
pub mod test_stubs;

pub use config::{ConnectionLimits, DispatcherConfig};
pub use connection::{Connection, ConnectionObserver, LinkState, Subject, SubjectSlot};
pub use dispatcher::{EventDispatcher, ExecutionWaker, IdleStrategy};
pub use error::{CoreError, DisconnectReason, ErrorCategory};
pub use factory::{
    ClientConnectionObserverFactory, ConnectFailReason, CreateObserver,
    ServerConnectionObserverFactory,
};
pub use stream::{ReceiveStream, SendStream, StreamError};

/// 内核统一结果别名。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
