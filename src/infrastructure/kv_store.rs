//! 共享键值缓存 - 基础设施层
//!
//! 进程外的 字节键 → 字节值 存储，只要求 get / set / expire / delete 语义。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::CacheError;

const TIER: &str = "shared";

#[async_trait]
pub trait SharedKvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// 重新设置过期时间，键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// 进程内实现，用于单进程运行和测试
#[derive(Debug)]
pub struct InMemoryKvStore {
    entries: RwLock<HashMap<String, (Vec<u8>, Instant)>>,
    available: AtomicBool,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟服务不可用
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                tier: TIER,
                message: "in-memory store marked unavailable".to_string(),
            })
        }
    }
}

#[async_trait]
impl SharedKvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, deadline)| *deadline > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        // 写入时顺带清掉已过期的条目
        entries.retain(|_, (_, deadline)| *deadline > now);
        entries.insert(key.to_string(), (value.to_vec(), now + ttl));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        match entries.get_mut(key).filter(|(_, deadline)| *deadline > now) {
            Some((_, deadline)) => {
                *deadline = now + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

/// 通过 HTTP 访问的共享缓存服务
///
/// 约定的接口：
/// - `GET    {base}/kv/{key}` → 200 返回字节，404 表示不存在
/// - `PUT    {base}/kv/{key}?ttl={secs}` 请求体为字节
/// - `POST   {base}/kv/{key}/expire?ttl={secs}`
/// - `DELETE {base}/kv/{key}`
pub struct HttpKvStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKvStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(unavailable)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key)
    }
}

fn unavailable(err: reqwest::Error) -> CacheError {
    CacheError::Unavailable {
        tier: TIER,
        message: err.to_string(),
    }
}

fn bad_status(status: reqwest::StatusCode) -> CacheError {
    CacheError::Unavailable {
        tier: TIER,
        message: format!("unexpected status {}", status),
    }
}

#[async_trait]
impl SharedKvStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let response = self.client.get(self.url(key)).send().await.map_err(unavailable)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(unavailable)?;
                debug!("共享缓存命中: {} ({} bytes)", key, bytes.len());
                Ok(Some(bytes.to_vec()))
            }
            status => Err(bad_status(status)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let response = self
            .client
            .put(self.url(key))
            .query(&[("ttl", ttl.as_secs())])
            .body(value.to_vec())
            .send()
            .await
            .map_err(unavailable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(bad_status(response.status()))
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let response = self
            .client
            .post(format!("{}/expire", self.url(key)))
            .query(&[("ttl", ttl.as_secs())])
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(bad_status(status)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let response = self
            .client
            .delete(self.url(key))
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(bad_status(status)),
        }
    }
}
