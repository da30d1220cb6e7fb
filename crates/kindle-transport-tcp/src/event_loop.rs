//! 基于 `mio::Poll` 的事件循环。
//!
//! # 设计定位（Why）
//! - 调度器只负责排空动作，平台阻塞等待由 [`IdleStrategy`] 提供；本模块把 `poll` 接入为空闲策略，
//!   让“执行动作”与“等待套接字就绪”在同一线程上交替进行；
//! - 辅助线程推入动作时需要打断 `poll`，因此调度器的 [`ExecutionWaker`] 由 `mio::Waker` 实现。
//!
//! # 逻辑（How）
//! - 进入 `poll` 前置位 `parked`，此后推入的动作才会真正触发 `Waker`；
//!   调度器队列非空时以零超时轮询，避免阻塞已排队的动作；
//! - 就绪事件按令牌还原为注册表标识，交给 [`TcpNetwork`] 分派到连接、监听器或连接器。

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kindle_core::dispatcher::{EventDispatcher, ExecutionWaker, IdleStrategy};
use kindle_core::error::CoreError;
use mio::event::Event;
use mio::{Events, Poll, Token, Waker};

use crate::config::TcpConfig;
use crate::error::{self, map_io_error};
use crate::network::TcpNetwork;

pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// 套接字就绪标志的快照。
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

/// 只在事件循环阻塞于 `poll` 时才真正触发系统调用的唤醒器。
struct PollWaker {
    waker: Waker,
    parked: AtomicBool,
}

impl ExecutionWaker for PollWaker {
    fn request_execution(&self) {
        if !self.parked.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.waker.wake() {
            tracing::warn!(error = %err, "failed to wake tcp event loop");
        }
    }
}

/// 套接字后端的驱动者：持有 `mio::Poll` 与调度器。
///
/// # 示例
/// ```rust,no_run
/// use kindle_transport_tcp::{TcpConfig, TcpEventLoop};
///
/// let mut event_loop = TcpEventLoop::new(TcpConfig::default())?;
/// let network = event_loop.network().clone();
/// # let _ = network;
/// event_loop.run();
/// # Ok::<(), kindle_core::CoreError>(())
/// ```
pub struct TcpEventLoop {
    poll: Poll,
    events: Events,
    waker: Arc<PollWaker>,
    dispatcher: EventDispatcher,
    network: TcpNetwork,
    poll_timeout: Option<Duration>,
}

impl TcpEventLoop {
    /// 创建事件循环、调度器与网络句柄。
    pub fn new(config: TcpConfig) -> Result<Self, CoreError> {
        let poll = Poll::new().map_err(|err| map_io_error(error::POLL, err))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|err| map_io_error(error::POLL, err))?;
        let waker = Arc::new(PollWaker {
            waker,
            parked: AtomicBool::new(false),
        });
        let dispatcher = EventDispatcher::with_waker(*config.dispatcher(), waker.clone());
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|err| map_io_error(error::POLL, err))?;
        let network = TcpNetwork::new(dispatcher.clone(), registry, config);
        Ok(Self {
            events: Events::with_capacity(config.events_capacity()),
            poll,
            waker,
            dispatcher,
            network,
            poll_timeout: config.poll_timeout(),
        })
    }

    /// 网络句柄，可克隆后交给其它组件。
    pub fn network(&self) -> &TcpNetwork {
        &self.network
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// 永久运行。
    pub fn run(&mut self) -> ! {
        let dispatcher = self.dispatcher.clone();
        dispatcher.run(self)
    }

    /// 在 `condition` 为真时运行；每轮排空后检查一次，最长间隔为 `poll_timeout`。
    pub fn run_while(&mut self, condition: impl FnMut() -> bool) {
        let dispatcher = self.dispatcher.clone();
        dispatcher.run_while(self, condition);
    }

    /// 单步推进：排空队列，轮询一次，再排空一次。
    pub fn turn(&mut self) {
        let dispatcher = self.dispatcher.clone();
        dispatcher.execute_all_actions();
        self.idle(&dispatcher);
        dispatcher.execute_all_actions();
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.waker.parked.store(true, Ordering::SeqCst);
        let timeout = if self.dispatcher.is_idle() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        let result = self.poll.poll(&mut self.events, timeout);
        self.waker.parked.store(false, Ordering::SeqCst);
        result
    }
}

impl IdleStrategy for TcpEventLoop {
    fn idle(&mut self, _dispatcher: &EventDispatcher) {
        if let Err(err) = self.poll_once(self.poll_timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                let err = map_io_error(error::POLL, err);
                tracing::warn!(error = %err, "tcp poll failed");
            }
            return;
        }
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            self.network.dispatch(event.token(), Readiness::from(event));
        }
    }
}

impl std::fmt::Debug for TcpEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEventLoop")
            .field("dispatcher", &self.dispatcher)
            .field("network", &self.network)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}
