/// 发送侧阶段。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendPhase {
    /// 没有未完成的发送请求。
    #[default]
    Idle,
    /// 已请求、尚未交付发送流。
    Requested { size: usize },
    /// 发送流已交付给观察者、尚未释放。
    Granted { size: usize },
}

/// 单一未完成发送流的显式状态。
///
/// # 契约（What）
/// - `Idle → request → Requested → grant → Granted → complete → Idle`；
///   在非 `Idle` 状态再次 `request`、或请求超过上限，均属于调用方违约，直接 `panic!`；
/// - 连接拆除时调用 [`cancel`](Self::cancel) 复位，此后迟到的 `grant`/`complete` 均为无操作。
///
/// 接收侧“同一时刻最多一个读者”的约束由 [`ReceiveSide`](crate::flow::ReceiveSide) 承担。
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamGate {
    send: SendPhase,
}

impl StreamGate {
    pub const fn new() -> Self {
        Self {
            send: SendPhase::Idle,
        }
    }

    /// 登记一次发送请求。
    pub fn request(&mut self, size: usize, max: usize) {
        assert!(
            size <= max,
            "send stream of {size} bytes exceeds the maximum of {max} bytes"
        );
        assert!(
            self.send == SendPhase::Idle,
            "send stream requested while a previous request is outstanding ({:?})",
            self.send
        );
        self.send = SendPhase::Requested { size };
    }

    /// 若存在待交付请求，转入 `Granted` 并返回请求大小。
    pub fn grant(&mut self) -> Option<usize> {
        match self.send {
            SendPhase::Requested { size } => {
                self.send = SendPhase::Granted { size };
                Some(size)
            }
            _ => None,
        }
    }

    /// 发送流释放后回到 `Idle`。
    pub fn complete(&mut self) {
        if matches!(self.send, SendPhase::Granted { .. }) {
            self.send = SendPhase::Idle;
        }
    }

    /// 拆除时丢弃任何未完成的发送请求。
    pub fn cancel(&mut self) {
        self.send = SendPhase::Idle;
    }

    pub fn send_phase(&self) -> SendPhase {
        self.send
    }

    /// 是否有等待交付的请求。
    pub fn is_requested(&self) -> bool {
        matches!(self.send, SendPhase::Requested { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_cycle_returns_to_idle() {
        let mut gate = StreamGate::new();
        gate.request(4, 8);
        assert_eq!(gate.grant(), Some(4));
        assert_eq!(gate.grant(), None, "同一请求只能交付一次");
        gate.complete();
        assert_eq!(gate.send_phase(), SendPhase::Idle);
        gate.request(8, 8);
    }

    #[test]
    #[should_panic(expected = "previous request is outstanding")]
    fn second_request_while_granted_panics() {
        let mut gate = StreamGate::new();
        gate.request(1, 8);
        let _ = gate.grant();
        gate.request(1, 8);
    }

    #[test]
    #[should_panic(expected = "exceeds the maximum")]
    fn oversize_request_panics() {
        StreamGate::new().request(9, 8);
    }

    #[test]
    fn cancel_discards_pending_request() {
        let mut gate = StreamGate::new();
        gate.request(1, 8);
        gate.cancel();
        assert_eq!(gate.grant(), None);
    }
}
