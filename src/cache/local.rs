//! 第一层：进程内缓存
//!
//! 短 TTL、条目数有上限，满了淘汰最早写入的条目。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::CacheTier;

/// 缓存条目，写入后不可修改
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content_hash: String,
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    /// 值最初来自哪一层
    pub tier: CacheTier,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Slots {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl Slots {
    fn forget(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.order.retain(|k| k != key);
        }
        removed
    }
}

#[derive(Debug)]
pub struct LocalCache {
    slots: Mutex<Slots>,
    ttl: Duration,
    capacity: usize,
}

impl LocalCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match slots.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                slots.forget(key);
                None
            }
            None => None,
        }
    }

    /// 写入一个值；已有未过期的值时不覆盖，返回旧值
    pub fn insert(&self, key: &str, value: &[u8], tier: CacheTier) -> Option<Vec<u8>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(existing) = slots.entries.get(key) {
            if existing.is_live(now) {
                return Some(existing.value.clone());
            }
        }
        slots.forget(key);

        while slots.entries.len() >= self.capacity {
            match slots.order.pop_front() {
                Some(oldest) => {
                    slots.entries.remove(&oldest);
                }
                None => break,
            }
        }

        slots.entries.insert(
            key.to_string(),
            CacheEntry {
                content_hash: key.to_string(),
                value: value.to_vec(),
                created_at: Utc::now(),
                ttl: self.ttl,
                tier,
                expires_at: now + self.ttl,
            },
        );
        slots.order.push_back(key.to_string());
        None
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .cloned()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget(key)
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
