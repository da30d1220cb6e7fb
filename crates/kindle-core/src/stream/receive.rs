use alloc::boxed::Box;
use alloc::sync::Arc;
use bytes::Bytes;
use core::fmt;

use super::StreamError;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 接收流与连接共享的读取进度。
///
/// 接收流每次前进或回绕都会更新位置，连接在 `ack_received` 时读取它，
/// 因此即便接收流仍然存活，也只会确认真正读过的字节。
#[derive(Debug, Default)]
pub struct ReadCursor {
    position: AtomicUsize,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前读取位置（相对于快照起点）。
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }

    fn set(&self, position: usize) {
        self.position.store(position, Ordering::Release);
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// 未确认入站字节的可回绕读视图。
///
/// # 契约（What）
/// - 视图是创建时刻缓冲内容的不可变快照，之后到达的数据不会出现在本视图中；
/// - 在 `ack_received` 之前重复获取接收流，得到的是同一段字节（至少一次投递）；
/// - 释放时通知连接“读者已关闭”，连接才允许再次 `receive_stream`。
///
/// # 示例
/// ```rust
/// use kindle_core::stream::ReceiveStream;
///
/// let mut reader = ReceiveStream::detached(b"kindle".as_slice().into());
/// let marker = reader.save_marker();
/// let mut head = [0u8; 3];
/// reader.extract(&mut head).unwrap();
/// assert_eq!(&head, b"kin");
/// reader.rewind(marker).unwrap();
/// assert_eq!(reader.extract_contiguous(usize::MAX), b"kindle");
/// assert!(reader.is_empty());
/// ```
pub struct ReceiveStream {
    data: Bytes,
    position: usize,
    cursor: Arc<ReadCursor>,
    release: Option<ReleaseFn>,
}

impl ReceiveStream {
    /// 绑定到连接的接收流。
    pub fn new(
        data: Bytes,
        cursor: Arc<ReadCursor>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        cursor.set(0);
        Self {
            data,
            position: 0,
            cursor,
            release: Some(Box::new(release)),
        }
    }

    /// 不与任何连接关联的接收流，例如连接拆除后的空读者。
    pub fn detached(data: Bytes) -> Self {
        Self {
            data,
            position: 0,
            cursor: Arc::new(ReadCursor::new()),
            release: None,
        }
    }

    /// 空读者。
    pub fn empty() -> Self {
        Self::detached(Bytes::new())
    }

    /// 剩余可读字节数。
    pub fn available(&self) -> usize {
        self.data.len() - self.position
    }

    /// 是否已读完。
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// 已读字节数。
    pub fn consumed(&self) -> usize {
        self.position
    }

    /// 剩余字节的只读视图，不推进位置。
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.position..]
    }

    /// 查看下一个字节。
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    /// 精确读取 `dst.len()` 字节；不足时返回 [`StreamError::Underflow`] 且不前进。
    pub fn extract(&mut self, dst: &mut [u8]) -> Result<(), StreamError> {
        let available = self.available();
        if dst.len() > available {
            return Err(StreamError::Underflow {
                requested: dst.len(),
                available,
            });
        }
        let end = self.position + dst.len();
        dst.copy_from_slice(&self.data[self.position..end]);
        self.advance_to(end);
        Ok(())
    }

    /// 读取至多 `max` 字节的连续区间。
    pub fn extract_contiguous(&mut self, max: usize) -> &[u8] {
        let start = self.position;
        let end = start + max.min(self.available());
        self.advance_to(end);
        &self.data[start..end]
    }

    /// 跳过至多 `count` 字节，返回实际跳过的数量。
    pub fn skip(&mut self, count: usize) -> usize {
        let skipped = count.min(self.available());
        self.advance_to(self.position + skipped);
        skipped
    }

    /// 当前读取位置。
    pub fn save_marker(&self) -> usize {
        self.position
    }

    /// 回到之前保存的位置。
    pub fn rewind(&mut self, marker: usize) -> Result<(), StreamError> {
        if marker > self.data.len() {
            return Err(StreamError::InvalidMarker {
                marker,
                limit: self.data.len(),
            });
        }
        self.advance_to(marker);
        Ok(())
    }

    fn advance_to(&mut self, position: usize) {
        self.position = position;
        self.cursor.set(position);
    }
}

impl Drop for ReceiveStream {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ReceiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveStream")
            .field("len", &self.data.len())
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(feature = "std")]
impl std::io::Read for ReceiveStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let chunk = self.extract_contiguous(buf.len());
        let len = chunk.len();
        buf[..len].copy_from_slice(chunk);
        Ok(len)
    }
}
