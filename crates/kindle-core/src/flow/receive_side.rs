use alloc::sync::Arc;
use bytes::Bytes;

use super::ReceiveBuffer;
use crate::stream::ReadCursor;

/// 连接接收侧的簿记：有界缓冲、当前读者的游标、已确认字节数与数据通知闩锁。
///
/// # 契约（What）
/// - 同一时刻最多一个存活读者，[`open_reader`](Self::open_reader) 违背时 `panic!`；
/// - [`ack`](Self::ack) 只释放读者实际读过、尚未确认的前缀，未确认的字节下次打开读者时仍在；
/// - 闩锁拉起后直到 [`lower_latch`](Self::lower_latch) 之前，新到的数据不再重复通知；
/// - `stalled` 记录因缓冲写满而暂停的上游读取，确认腾出空间后由调用方恢复。
#[derive(Debug)]
pub struct ReceiveSide {
    buffer: ReceiveBuffer,
    cursor: Option<Arc<ReadCursor>>,
    acked: usize,
    reader_open: bool,
    data_pending: bool,
    stalled: bool,
}

impl ReceiveSide {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: ReceiveBuffer::with_capacity(capacity),
            cursor: None,
            acked: 0,
            reader_open: false,
            data_pending: false,
            stalled: false,
        }
    }

    pub fn buffer(&self) -> &ReceiveBuffer {
        &self.buffer
    }

    /// 追加入站字节，返回实际接受的数量。
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        self.buffer.push(bytes)
    }

    /// 登记新读者，返回当前未确认字节的快照与它的游标。
    pub fn open_reader(&mut self) -> (Bytes, Arc<ReadCursor>) {
        assert!(
            !self.reader_open,
            "receive stream requested while a previous reader is still alive"
        );
        self.reader_open = true;
        let cursor = Arc::new(ReadCursor::new());
        self.cursor = Some(Arc::clone(&cursor));
        self.acked = 0;
        (self.buffer.snapshot(), cursor)
    }

    pub fn close_reader(&mut self) {
        self.reader_open = false;
    }

    /// 确认读者已读过的字节，返回本次释放的数量。
    pub fn ack(&mut self) -> usize {
        let Some(position) = self.cursor.as_ref().map(|cursor| cursor.position()) else {
            return 0;
        };
        let consumed = position.saturating_sub(self.acked);
        self.acked = self.acked.max(position);
        self.buffer.consume(consumed);
        consumed
    }

    /// 拉起数据通知闩锁；已拉起时返回 `false`，调用方不应再次投递。
    pub fn raise_latch(&mut self) -> bool {
        !core::mem::replace(&mut self.data_pending, true)
    }

    /// 通知投递时落下闩锁。
    pub fn lower_latch(&mut self) {
        self.data_pending = false;
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// 取出并清除暂停标记。
    pub fn take_stalled(&mut self) -> bool {
        core::mem::take(&mut self.stalled)
    }

    /// 拆除时丢弃缓冲与游标。
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = None;
        self.acked = 0;
        self.stalled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ReceiveStream;

    #[test]
    fn ack_releases_only_what_the_reader_consumed() {
        let mut side = ReceiveSide::with_capacity(16);
        side.push(b"kindling");
        let (snapshot, cursor) = side.open_reader();
        let mut reader = ReceiveStream::new(snapshot, cursor, || {});
        let mut head = [0u8; 4];
        reader.extract(&mut head).expect("可读 4 字节");
        drop(reader);
        side.close_reader();

        assert_eq!(side.ack(), 4);
        assert_eq!(side.ack(), 0, "重复确认不释放新字节");
        let (snapshot, _cursor) = side.open_reader();
        assert_eq!(&snapshot[..], b"ling");
    }

    #[test]
    #[should_panic(expected = "previous reader is still alive")]
    fn second_reader_panics() {
        let mut side = ReceiveSide::with_capacity(4);
        let _first = side.open_reader();
        let _second = side.open_reader();
    }

    #[test]
    fn latch_coalesces_until_lowered() {
        let mut side = ReceiveSide::with_capacity(4);
        assert!(side.raise_latch());
        assert!(!side.raise_latch());
        side.lower_latch();
        assert!(side.raise_latch());
    }

    #[test]
    fn clear_forgets_the_cursor() {
        let mut side = ReceiveSide::with_capacity(4);
        side.push(b"ab");
        let (_snapshot, _cursor) = side.open_reader();
        side.set_stalled(true);
        side.clear();
        assert_eq!(side.ack(), 0);
        assert!(!side.take_stalled());
        assert!(side.buffer().is_empty());
    }
}
