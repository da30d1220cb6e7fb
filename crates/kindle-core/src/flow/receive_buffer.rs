use bytes::{Buf, Bytes, BytesMut};

/// 有界入站字节队列。
///
/// - [`push`](Self::push) 只接受放得下的部分，返回实际接受的字节数；
/// - [`snapshot`](Self::snapshot) 复制出当前全部未确认字节，交给接收流只读；
/// - [`consume`](Self::consume) 在 `ack_received` 时从队首释放。
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: BytesMut,
    capacity: usize,
}

impl ReceiveBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.advance(count);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 剩余可接收字节。
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_truncates_at_capacity() {
        let mut buffer = ReceiveBuffer::with_capacity(4);
        assert_eq!(buffer.push(b"abc"), 3);
        assert_eq!(buffer.push(b"def"), 1, "仅接受剩余容量内的字节");
        assert!(buffer.is_full());
        buffer.consume(2);
        assert_eq!(&buffer.snapshot()[..], b"cd");
        assert_eq!(buffer.remaining(), 2);
    }
}
