//! Read-through result cache.
//!
//! Keys are derived from the compiled statement (SQL text plus JSON-encoded
//! bindings). Entries are never invalidated automatically; callers call
//! [`CacheProvider::forget`] or [`CacheProvider::flush`] after writes.

use crate::driver::QueryResult;
use crate::grammar::Statement;
use crate::value::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Storage behind [`QueryBuilder::get_cached`](crate::QueryBuilder::get_cached).
pub trait CacheProvider: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Option<QueryResult>> + Send;

    fn set(&self, key: &str, value: QueryResult, ttl: Duration)
    -> impl Future<Output = ()> + Send;

    fn forget(&self, key: &str) -> impl Future<Output = ()> + Send;

    fn flush(&self) -> impl Future<Output = ()> + Send;
}

/// Cache key for a compiled statement.
pub fn cache_key(stmt: &Statement) -> String {
    let bindings = serde_json::Value::Array(stmt.bindings.iter().map(Value::to_json).collect());
    format!("{}|{}", stmt.sql, bindings)
}

/// In-process TTL cache with LRU eviction.
#[derive(Debug)]
pub struct InMemoryCache {
    inner: Mutex<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    capacity: usize,
    map: HashMap<String, (QueryResult, Instant)>,
    order: VecDeque<String>,
}

impl InMemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                capacity,
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k.as_str() == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if self.map.remove(key).is_some() {
            if let Some(pos) = self.order.iter().position(|k| k.as_str() == key) {
                let _ = self.order.remove(pos);
            }
        }
    }

    fn evict_if_needed(&mut self) {
        if self.capacity == 0 {
            self.map.clear();
            self.order.clear();
            return;
        }
        while self.map.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            let _ = self.map.remove(&oldest);
        }
    }
}

impl CacheProvider for InMemoryCache {
    async fn get(&self, key: &str) -> Option<QueryResult> {
        let mut inner = self.lock();
        let (value, expires_at) = inner.map.get(key)?.clone();
        if Instant::now() >= expires_at {
            inner.remove(key);
            return None;
        }
        inner.touch(key);
        Some(value)
    }

    async fn set(&self, key: &str, value: QueryResult, ttl: Duration) {
        let mut inner = self.lock();
        let expires_at = Instant::now() + ttl;
        if inner.map.insert(key.to_string(), (value, expires_at)).is_some() {
            inner.touch(key);
        } else {
            inner.order.push_back(key.to_string());
        }
        inner.evict_if_needed();
    }

    async fn forget(&self, key: &str) {
        self.lock().remove(key);
    }

    async fn flush(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.order.clear();
    }
}
