//! 带代际校验的有界注册表。
//!
//! # 意图（Why）
//! - 连接的存活期由注册表显式持有，拆除即“从注册表移除”，不依赖对象持有自身强引用；
//! - 索引复用后旧的 [`ConnectionId`] 因代际不匹配而失效，过期的就绪事件或回调无法误伤新连接。
//!
//! # 契约（What）
//! - 容量在构造时固定，`insert` 在满时把值原样退回；
//! - `ConnectionId` 可与 `usize` 令牌互转，供 `mio::Token` 等平台句柄使用。

use alloc::vec::Vec;
use core::fmt;

/// 注册表条目标识：槽位索引 + 代际。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// 槽位索引。
    pub fn index(&self) -> u32 {
        self.index
    }

    /// 代际编号。
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// 编码为平台令牌：低 32 位为索引，高位为代际（32 位目标上仅保留索引的低 16 位与代际的低 16 位）。
    pub fn to_token(self) -> usize {
        #[cfg(target_pointer_width = "64")]
        {
            ((self.generation as usize) << 32) | self.index as usize
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            (((self.generation & 0xFFFF) as usize) << 16) | (self.index & 0xFFFF) as usize
        }
    }

    /// 从平台令牌还原。
    pub fn from_token(token: usize) -> Self {
        #[cfg(target_pointer_width = "64")]
        {
            Self {
                index: (token & 0xFFFF_FFFF) as u32,
                generation: (token >> 32) as u32,
            }
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            Self {
                index: (token & 0xFFFF) as u32,
                generation: ((token >> 16) & 0xFFFF) as u32,
            }
        }
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// 有界 slab。
pub struct Registry<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> Registry<T> {
    /// 以固定容量构造。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// 插入新值；已满时原样返回 `Err(value)`。
    pub fn insert(&mut self, value: T) -> Result<ConnectionId, T> {
        if self.len >= self.capacity {
            return Err(value);
        }
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.entries[index as usize];
                let generation = match &*slot {
                    Entry::Vacant { generation } => generation.wrapping_add(1),
                    Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                *slot = Entry::Occupied { generation, value };
                ConnectionId { index, generation }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry::Occupied {
                    generation: 0,
                    value,
                });
                ConnectionId {
                    index,
                    generation: 0,
                }
            }
        };
        self.len += 1;
        Ok(id)
    }

    /// 按标识查找；代际不符返回 `None`。
    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// 移除并返回值；代际不符时不做任何改动。
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.entries.get_mut(id.index as usize)?;
        let generation = match &*slot {
            Entry::Occupied { generation, .. } if *generation == id.generation => *generation,
            _ => return None,
        };
        let previous = core::mem::replace(slot, Entry::Vacant { generation });
        self.free.push(id.index);
        self.len -= 1;
        match previous {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// 标识是否仍然有效。
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// 当前条目数。
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 固定容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 遍历所有存活条目。
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    ConnectionId {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
