use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use super::StreamError;

type CommitFn = Box<dyn FnOnce(Vec<u8>) + Send + 'static>;

/// 有界发送流。
///
/// # 意图（Why）
/// - 观察者在回调中同步写入，写完即释放；释放（`Drop` 或 [`commit`](Self::commit)）把已写字节交给连接；
/// - 上限等于 `request_send_stream` 请求的大小，写入不会超过连接承诺的缓冲。
///
/// # 契约（What）
/// - [`insert`](Self::insert) 要么全部写入，要么返回 [`StreamError::Overflow`] 且不写入任何字节；
/// - [`save_marker`](Self::save_marker) + [`overwrite`](Self::overwrite) 支持先占位、后回填报文头；
/// - 提交回调恰好执行一次，即使写入为空也会执行，以便连接回到 `Idle`。
///
/// # 示例
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use kindle_core::stream::SendStream;
///
/// let sink = Arc::new(Mutex::new(Vec::new()));
/// let target = Arc::clone(&sink);
/// let mut stream = SendStream::new(8, move |bytes| *target.lock().unwrap() = bytes);
/// let length = stream.save_marker();
/// stream.insert(&[0]).unwrap();
/// stream.insert(b"abc").unwrap();
/// stream.overwrite(length, &[3]).unwrap();
/// drop(stream);
/// assert_eq!(*sink.lock().unwrap(), b"\x03abc".to_vec());
/// ```
pub struct SendStream {
    buffer: Vec<u8>,
    limit: usize,
    commit: Option<CommitFn>,
}

impl SendStream {
    /// 构造上限为 `limit` 字节的发送流，释放时以已写字节调用 `commit`。
    pub fn new(limit: usize, commit: impl FnOnce(Vec<u8>) + Send + 'static) -> Self {
        Self {
            buffer: Vec::with_capacity(limit),
            limit,
            commit: Some(Box::new(commit)),
        }
    }

    /// 追加字节。
    pub fn insert(&mut self, data: &[u8]) -> Result<(), StreamError> {
        let available = self.available();
        if data.len() > available {
            return Err(StreamError::Overflow {
                requested: data.len(),
                available,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// 尽量追加，返回实际写入的字节数。
    pub fn insert_partial(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.available());
        self.buffer.extend_from_slice(&data[..accepted]);
        accepted
    }

    /// 剩余可写字节。
    pub fn available(&self) -> usize {
        self.limit - self.buffer.len()
    }

    /// 已写字节。
    pub fn written(&self) -> usize {
        self.buffer.len()
    }

    /// 上限。
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 当前写入位置，供之后 [`overwrite`](Self::overwrite) 回填。
    pub fn save_marker(&self) -> usize {
        self.buffer.len()
    }

    /// 覆写 `marker` 起的已写字节；不得越过当前写入位置。
    pub fn overwrite(&mut self, marker: usize, data: &[u8]) -> Result<(), StreamError> {
        let end = marker.checked_add(data.len()).unwrap_or(usize::MAX);
        if end > self.buffer.len() {
            return Err(StreamError::InvalidMarker {
                marker: end,
                limit: self.buffer.len(),
            });
        }
        self.buffer[marker..end].copy_from_slice(data);
        Ok(())
    }

    /// 已写字节的只读视图。
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// 显式提交，等价于 `drop(stream)`。
    pub fn commit(self) {}
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if let Some(commit) = self.commit.take() {
            commit(core::mem::take(&mut self.buffer));
        }
    }
}

impl fmt::Debug for SendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendStream")
            .field("written", &self.buffer.len())
            .field("limit", &self.limit)
            .finish()
    }
}

/// 部分写入语义：剩余容量为零时返回 `WouldBlock`，供 TLS 引擎等推模型输出使用。
#[cfg(feature = "std")]
impl std::io::Write for SendStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.available() == 0 {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        Ok(self.insert_partial(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
