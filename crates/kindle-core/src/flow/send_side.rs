use super::{PoolPermit, SendBufferPool, WaiterId};
use crate::stream::{SendPhase, StreamGate};

/// [`SendSide::request`] 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// 槽位已预留，调用方应安排交付发送流。
    Granted,
    /// 发送池耗尽，已登记等待；槽位转交时经回调送达。
    Queued,
}

/// 连接发送侧的簿记：单一未完成请求、已预留的池槽位与等待登记。
///
/// # 逻辑（How）
/// - [`request`](Self::request) 推进闸门并立即尝试预留槽位，失败则以调用方给出的回调登记等待；
/// - 池转交槽位时回调调用 [`accept_slot`](Self::accept_slot)，请求已撤销则把凭证退回池；
/// - [`take_grant`](Self::take_grant) 同时取出请求大小与凭证，二者缺一不交付。
///
/// # 契约（What）
/// - 只保存状态，不调度、不回调；调用方在自己的锁内操作，锁外投递发送流；
/// - 拆除时 [`cancel`](Self::cancel) 复位闸门、释放预留槽位并撤销等待登记。
#[derive(Debug, Default)]
pub struct SendSide {
    gate: StreamGate,
    granted: Option<PoolPermit>,
    waiter: Option<WaiterId>,
}

impl SendSide {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次 `size` 字节的请求；违背单一未完成请求或上限时 `panic!`。
    pub fn request(
        &mut self,
        size: usize,
        max: usize,
        pool: &SendBufferPool,
        on_slot: impl FnOnce(PoolPermit) -> Option<PoolPermit> + Send + 'static,
    ) -> Reservation {
        self.gate.request(size, max);
        match pool.try_acquire() {
            Some(permit) => {
                self.granted = Some(permit);
                Reservation::Granted
            }
            None => {
                self.waiter = Some(pool.wait(on_slot));
                Reservation::Queued
            }
        }
    }

    /// 收下池转交的槽位；请求已不存在时原样退回。
    pub fn accept_slot(&mut self, permit: PoolPermit) -> Result<(), PoolPermit> {
        self.waiter = None;
        if self.gate.is_requested() && self.granted.is_none() {
            self.granted = Some(permit);
            Ok(())
        } else {
            Err(permit)
        }
    }

    /// 取出待交付请求的大小与槽位，闸门转入 `Granted`。
    pub fn take_grant(&mut self) -> Option<(usize, PoolPermit)> {
        self.granted.as_ref()?;
        let size = self.gate.grant()?;
        let permit = self.granted.take()?;
        Some((size, permit))
    }

    /// 发送流释放后回到 `Idle`。
    pub fn complete(&mut self) {
        self.gate.complete();
    }

    pub fn cancel(&mut self, pool: &SendBufferPool) {
        self.gate.cancel();
        self.granted = None;
        if let Some(waiter) = self.waiter.take() {
            pool.cancel(waiter);
        }
    }

    pub fn phase(&self) -> SendPhase {
        self.gate.send_phase()
    }

    /// 是否在发送池队列中等待。
    pub fn is_queued(&self) -> bool {
        self.waiter.is_some()
    }
}
