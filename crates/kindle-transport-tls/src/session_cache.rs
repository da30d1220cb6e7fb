//! 客户端会话缓存。
//!
//! # 设计定位（Why）
//! - 嵌入式客户端通常只与少数几个固定服务器通信，按目标保留会话票据即可让重连跳过完整握手；
//! - 每个目标拥有独立的 `ClientConfig` 与会话存储，握手失败时整体丢弃该目标的条目，
//!   下次连接从完整握手重新开始，不会反复尝试一张已被服务器拒绝的票据。
//!
//! # 契约（What）
//! - 条目数不超过构造时的容量，超出时淘汰最久未使用的目标；
//! - [`ClientSessionCache::config_for`] 命中时刷新该目标的新近度。

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use kindle_core::sync::lock;
use rustls::ClientConfig;
use rustls::client::{ClientSessionMemoryCache, Resumption};

/// 会话缓存的键：主机名（忽略大小写）或 IP 地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Hostname(String),
    Address(IpAddr),
}

impl SessionKey {
    /// 由用户给出的服务器名推导键；能解析为 IP 地址时按地址归类。
    pub fn for_host(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(address) => Self::Address(address),
            Err(_) => Self::Hostname(host.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hostname(name) => f.write_str(name),
            Self::Address(address) => write!(f, "{address}"),
        }
    }
}

struct CacheInner {
    base: Arc<ClientConfig>,
    capacity: usize,
    sessions_per_key: usize,
    // 队尾为最近使用。
    entries: VecDeque<(SessionKey, Arc<ClientConfig>)>,
}

/// 以目标为键的有界 LRU 缓存，值为带独立会话存储的 `ClientConfig`。
///
/// 克隆得到的句柄共享同一份缓存。
///
/// # 示例
/// ```rust
/// use std::sync::Arc;
/// use rustls::{ClientConfig, RootCertStore};
/// use kindle_transport_tls::{ClientSessionCache, SessionKey};
///
/// let provider = Arc::new(rustls::crypto::ring::default_provider());
/// let base = ClientConfig::builder_with_provider(provider)
///     .with_safe_default_protocol_versions()
///     .unwrap()
///     .with_root_certificates(RootCertStore::empty())
///     .with_no_client_auth();
/// let cache = ClientSessionCache::new(Arc::new(base), 2, 4);
/// let key = SessionKey::for_host("device.local");
/// let first = cache.config_for(&key);
/// assert!(Arc::ptr_eq(&first, &cache.config_for(&key)));
/// assert!(cache.invalidate(&key));
/// assert!(!cache.contains(&key));
/// ```
#[derive(Clone)]
pub struct ClientSessionCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl ClientSessionCache {
    /// `capacity` 为零时 `panic!`。
    pub fn new(base: Arc<ClientConfig>, capacity: usize, sessions_per_key: usize) -> Self {
        assert!(capacity > 0, "session cache capacity must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                base,
                capacity,
                sessions_per_key,
                entries: VecDeque::with_capacity(capacity),
            })),
        }
    }

    /// 取得目标对应的配置；不存在时以基础配置派生一份新的，必要时淘汰最久未用的目标。
    pub fn config_for(&self, key: &SessionKey) -> Arc<ClientConfig> {
        let mut inner = lock(&self.inner);
        if let Some(index) = inner.entries.iter().position(|(cached, _)| cached == key) {
            if let Some(entry) = inner.entries.remove(index) {
                let config = Arc::clone(&entry.1);
                inner.entries.push_back(entry);
                return config;
            }
        }

        let mut config = ClientConfig::clone(&inner.base);
        config.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(
            inner.sessions_per_key,
        )));
        let config = Arc::new(config);
        if inner.entries.len() == inner.capacity {
            if let Some((evicted, _)) = inner.entries.pop_front() {
                tracing::trace!(%evicted, "tls session cache evicted least recently used target");
            }
        }
        inner.entries.push_back((key.clone(), Arc::clone(&config)));
        config
    }

    /// 丢弃目标的会话；返回条目是否存在。
    pub fn invalidate(&self, key: &SessionKey) -> bool {
        let mut inner = lock(&self.inner);
        let index = inner.entries.iter().position(|(cached, _)| cached == key);
        match index {
            Some(index) => {
                inner.entries.remove(index);
                tracing::debug!(%key, "tls session cache entry invalidated");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        lock(&self.inner)
            .entries
            .iter()
            .any(|(cached, _)| cached == key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner).capacity
    }
}

impl fmt::Debug for ClientSessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ClientSessionCache")
            .field("len", &inner.entries.len())
            .field("capacity", &inner.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::RootCertStore;

    fn cache(capacity: usize) -> ClientSessionCache {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let base = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("ring 支持默认协议版本")
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        ClientSessionCache::new(Arc::new(base), capacity, 2)
    }

    #[test]
    fn keys_distinguish_names_from_addresses() {
        assert_eq!(
            SessionKey::for_host("192.168.1.7"),
            SessionKey::Address(IpAddr::from([192, 168, 1, 7]))
        );
        assert_eq!(
            SessionKey::for_host("Sensor.LOCAL"),
            SessionKey::Hostname("sensor.local".into())
        );
        assert_eq!(
            SessionKey::for_host("::1"),
            SessionKey::Address("::1".parse().expect("合法地址"))
        );
    }

    #[test]
    fn least_recently_used_target_is_evicted() {
        let cache = cache(2);
        let a = SessionKey::for_host("a.example");
        let b = SessionKey::for_host("b.example");
        let c = SessionKey::for_host("c.example");

        let first_a = cache.config_for(&a);
        cache.config_for(&b);
        // 命中刷新 a 的新近度，淘汰对象变为 b。
        assert!(Arc::ptr_eq(&first_a, &cache.config_for(&a)));
        cache.config_for(&c);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn invalidated_target_gets_a_fresh_config() {
        let cache = cache(4);
        let key = SessionKey::for_host("10.0.0.1");
        let before = cache.config_for(&key);
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key), "重复失效返回 false");
        let after = cache.config_for(&key);
        assert!(!Arc::ptr_eq(&before, &after), "失效后应派生新的会话存储");
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn zero_capacity_panics() {
        let _ = cache(0);
    }
}
