use alloc::collections::VecDeque;
use bytes::{Buf, Bytes};

use super::PoolPermit;

/// 已提交、尚未完全写出的发送块；块写完之前一直占用发送池槽位。
#[derive(Debug)]
pub struct OutgoingChunk {
    data: Bytes,
    _permit: PoolPermit,
}

impl OutgoingChunk {
    pub fn new(data: Bytes, permit: PoolPermit) -> Self {
        Self {
            data,
            _permit: permit,
        }
    }

    /// 尚未写出的字节。
    pub fn pending(&self) -> &[u8] {
        &self.data
    }
}

/// 连接的待发队列。
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    chunks: VecDeque<OutgoingChunk>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: OutgoingChunk) {
        self.chunks.push_back(chunk);
    }

    /// 队首尚未写出的字节。
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(OutgoingChunk::pending)
    }

    /// 队首尚未写出字节的廉价克隆，便于在不持锁的情况下交给对端。
    pub fn front_bytes(&self) -> Option<Bytes> {
        self.chunks.front().map(|chunk| chunk.data.clone())
    }

    /// 标记队首已写出 `count` 字节；块写完即出队并归还发送池槽位。
    pub fn advance(&mut self, count: usize) {
        if let Some(front) = self.chunks.front_mut() {
            let count = count.min(front.data.len());
            front.data.advance(count);
            if front.data.is_empty() {
                self.chunks.pop_front();
            }
        }
    }

    /// 丢弃全部待发数据（中止路径）。
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// 待发字节总数。
    pub fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.data.len()).sum()
    }
}
