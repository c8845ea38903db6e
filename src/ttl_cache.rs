use lru::LruCache;
use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 带容量上限和逐条过期时间的 LRU 缓存
///
/// 锁封装在内部，调用方不需要关心互斥。所有操作都是 O(1)。
#[derive(Debug)]
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    /// None 表示永不过期
    expires: Option<Instant>,
}

impl<V> Entry<V> {
    #[inline]
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires.map_or(true, |t| now < t)
    }
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    /// 创建缓存，容量为 0 时按 1 处理
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
        // 持锁期间不会 panic，中毒时直接取回数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 读取并提升为最近使用，过期条目会被顺带删除
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut cache = self.lock();
        match cache.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    /// 只读查询，不改变 LRU 顺序
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let cache = self.lock();
        cache
            .peek(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    /// 是否存在未过期的条目
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.peek(key).is_some()
    }

    /// 写入条目，`ttl` 为 None 表示永不过期
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.lock().put(key, Entry { value, expires });
    }

    /// 删除条目，返回旧值（即使已过期）
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().pop(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// 当前条目数（包含尚未被清理的过期条目）
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 未过期条目的快照
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.is_fresh(now))
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect()
    }
}
