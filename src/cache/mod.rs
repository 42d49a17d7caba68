//! 三层内容寻址缓存
//!
//! 查询顺序：进程内 → 共享键值存储 → 计算。推理服务端的上下文缓存单独走
//! `context_handle_for`，由派发器在每个批次开始时取一次。
//!
//! 每一层出错都只降级：记录 `CacheUnavailable`，继续往下走，操作本身仍然成功。
//! 条目写入后不可修改，同一个键以第一次写入为准。

pub mod content_hash;
pub mod context;
pub mod local;
pub mod warmup;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CacheError, Component, ErrorKind, ErrorLog, ProviderError};
use crate::infrastructure::{ContextHandle, DurableStore, InferenceProvider, SharedKvStore};

pub use content_hash::{cache_key, ContentHasher};
pub use context::ProviderContextCache;
pub use local::{CacheEntry, LocalCache};
pub use warmup::WarmupReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Local,
    Shared,
    Provider,
}

impl CacheTier {
    pub fn name(self) -> &'static str {
        match self {
            CacheTier::Local => "local",
            CacheTier::Shared => "shared",
            CacheTier::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub local_ttl: Duration,
    pub local_capacity: usize,
    pub shared_ttl: Duration,
    pub context_ttl: Duration,
    pub context_min_tokens: usize,
    pub warmup_lookback_days: i64,
    pub warmup_min_confidence: f64,
    pub warmup_batch_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CacheSettings {
    fn from(config: &Config) -> Self {
        Self {
            local_ttl: Duration::from_secs(config.local_cache_ttl_secs),
            local_capacity: config.local_cache_capacity,
            shared_ttl: Duration::from_secs(config.shared_cache_ttl_secs),
            context_ttl: Duration::from_secs(config.context_cache_ttl_secs),
            context_min_tokens: config.context_cache_min_tokens,
            warmup_lookback_days: config.warmup_lookback_days,
            warmup_min_confidence: config.warmup_min_confidence,
            warmup_batch_size: config.warmup_batch_size,
        }
    }
}

/// 各层命中统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub local_misses: u64,
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub provider_hits: u64,
    pub provider_misses: u64,
    pub computed: u64,
    pub degraded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    shared_hits: AtomicU64,
    shared_misses: AtomicU64,
    provider_hits: AtomicU64,
    provider_misses: AtomicU64,
    computed: AtomicU64,
    degraded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// 共享层查询结果
enum SharedLookup {
    Hit(Vec<u8>),
    Miss,
    Unavailable,
}

/// 本地 + 共享两层的查询结果；未命中时带上共享层的状态，决定是否写回
enum Lookup {
    Hit(Vec<u8>),
    Missed(SharedLookup),
}

pub struct CacheManager {
    settings: CacheSettings,
    local: LocalCache,
    shared: Option<Arc<dyn SharedKvStore>>,
    context: Option<ProviderContextCache>,
    durable: Option<Arc<dyn DurableStore>>,
    errors: Arc<ErrorLog>,
    counters: Counters,
}

impl CacheManager {
    pub fn new(settings: CacheSettings, errors: Arc<ErrorLog>) -> Self {
        let local = LocalCache::new(settings.local_ttl, settings.local_capacity);
        Self {
            settings,
            local,
            shared: None,
            context: None,
            durable: None,
            errors,
            counters: Counters::default(),
        }
    }

    pub fn with_shared(mut self, store: Arc<dyn SharedKvStore>) -> Self {
        self.shared = Some(store);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.context = Some(ProviderContextCache::new(
            provider,
            self.settings.context_ttl,
            self.settings.context_min_tokens,
        ));
        self
    }

    pub fn with_durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// 依次查询各层，全部未命中时计算并写回
    ///
    /// 并发计算同一个键时，先写入的值胜出，所有调用方拿到同样的字节。
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        let lookup = match self.lookup(key).await {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Missed(lookup) => lookup,
        };

        let value = compute().await?;
        Ok(self.write_back(key, value, lookup).await)
    }

    /// 带解码的版本：命中的字节解码失败时视为未命中
    ///
    /// 坏条目会从所有层删除并记录 `CacheUnavailable`，然后重新计算，
    /// 缓存里的旧数据不会让调用失败。
    pub async fn get_or_compute_decoded<T, D, F, Fut, E>(
        &self,
        key: &str,
        decode: D,
        compute: F,
    ) -> Result<T, E>
    where
        D: Fn(&[u8]) -> Result<T, CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: From<CacheError>,
    {
        let lookup = match self.lookup(key).await {
            Lookup::Hit(value) => match decode(&value) {
                Ok(decoded) => return Ok(decoded),
                Err(e) => {
                    self.discard(key, &e).await;
                    SharedLookup::Miss
                }
            },
            Lookup::Missed(lookup) => lookup,
        };

        let computed = compute().await?;
        let stored = self.write_back(key, computed.clone(), lookup).await;
        match decode(&stored) {
            Ok(decoded) => Ok(decoded),
            Err(_) => decode(&computed).map_err(E::from),
        }
    }

    /// 以 JSON 存取的便捷版本
    pub async fn get_or_compute_json<T, F, Fut, E>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        self.get_or_compute_decoded(
            key,
            |bytes| serde_json::from_slice(bytes).map_err(CacheError::from),
            || async move {
                compute().await.and_then(|value| {
                    serde_json::to_vec(&value).map_err(|e| E::from(CacheError::from(e)))
                })
            },
        )
        .await
    }

    /// 直接写入一个值，返回本地层是否为新条目
    pub async fn put(&self, key: &str, value: &[u8]) -> bool {
        let fresh = self.local.insert(key, value, CacheTier::Local).is_none();
        if let SharedLookup::Miss = self.lookup_shared(key).await {
            self.set_shared(key, value).await;
        }
        fresh
    }

    /// 从所有层删除，返回是否有任何一层删掉了东西
    pub async fn invalidate(&self, key: &str) -> bool {
        let mut removed = self.local.remove(key);

        if let Some(shared) = &self.shared {
            match shared.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => self.degrade(CacheTier::Shared, &e.to_string()),
            }
        }

        if let Some(context) = &self.context {
            match context.invalidate(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => self.degrade(CacheTier::Provider, &e.to_string()),
            }
        }

        if removed {
            info!("🗑️ 已失效缓存: {}", key);
        }
        removed
    }

    /// 取（或创建）服务端上下文缓存句柄；不可用时返回 None，调用方改为内联发送
    pub async fn context_handle_for(&self, key: &str, content: &str) -> Option<ContextHandle> {
        let context = self.context.as_ref()?;
        match context.handle_for(key, content).await {
            Ok((handle, hit)) => {
                if hit {
                    bump(&self.counters.provider_hits);
                } else {
                    bump(&self.counters.provider_misses);
                }
                Some(handle)
            }
            Err(ProviderError::ContentTooSmall { tokens, min_tokens }) => {
                bump(&self.counters.provider_misses);
                info!(
                    "上下文约 {} tokens，低于服务端缓存下限 {}，改为内联发送",
                    tokens, min_tokens
                );
                self.errors.record(
                    Component::CacheManager,
                    ErrorKind::CacheContentTooSmall,
                    format!("{}: {} < {} tokens", key, tokens, min_tokens),
                );
                None
            }
            Err(e) => {
                bump(&self.counters.provider_misses);
                self.degrade(CacheTier::Provider, &e.to_string());
                None
            }
        }
    }

    /// 后台预热，不阻塞调用方
    pub fn warmup(self: &Arc<Self>) -> JoinHandle<WarmupReport> {
        let manager = Arc::clone(self);
        match self.durable.clone() {
            Some(store) => tokio::spawn(warmup::run(manager, store)),
            None => {
                debug!("未配置持久化存储，跳过缓存预热");
                tokio::spawn(async { WarmupReport::default() })
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            local_hits: load(&c.local_hits),
            local_misses: load(&c.local_misses),
            shared_hits: load(&c.shared_hits),
            shared_misses: load(&c.shared_misses),
            provider_hits: load(&c.provider_hits),
            provider_misses: load(&c.provider_misses),
            computed: load(&c.computed),
            degraded: load(&c.degraded),
        }
    }

    async fn lookup(&self, key: &str) -> Lookup {
        if let Some(value) = self.local.get(key) {
            bump(&self.counters.local_hits);
            debug!("本地缓存命中: {}", key);
            return Lookup::Hit(value);
        }
        bump(&self.counters.local_misses);

        match self.lookup_shared(key).await {
            SharedLookup::Hit(value) => {
                bump(&self.counters.shared_hits);
                debug!("共享缓存命中: {}", key);
                let value = self
                    .local
                    .insert(key, &value, CacheTier::Shared)
                    .unwrap_or(value);
                Lookup::Hit(value)
            }
            other => Lookup::Missed(other),
        }
    }

    /// 写回计算结果；本地已有值时以已有值为准
    async fn write_back(&self, key: &str, value: Vec<u8>, lookup: SharedLookup) -> Vec<u8> {
        bump(&self.counters.computed);
        if let Some(existing) = self.local.insert(key, &value, CacheTier::Local) {
            return existing;
        }
        if let SharedLookup::Miss = lookup {
            self.set_shared(key, &value).await;
        }
        value
    }

    /// 丢弃无法解码的条目
    async fn discard(&self, key: &str, error: &CacheError) {
        warn!("⚠️ 缓存条目 {} 无法解码，丢弃后重新计算: {}", key, error);
        self.errors.record(
            Component::CacheManager,
            ErrorKind::CacheUnavailable,
            format!("{}: {}", key, error),
        );
        self.invalidate(key).await;
    }

    async fn lookup_shared(&self, key: &str) -> SharedLookup {
        let Some(shared) = &self.shared else {
            return SharedLookup::Unavailable;
        };
        match shared.get(key).await {
            Ok(Some(value)) => SharedLookup::Hit(value),
            Ok(None) => {
                bump(&self.counters.shared_misses);
                SharedLookup::Miss
            }
            Err(e) => {
                self.degrade(CacheTier::Shared, &e.to_string());
                SharedLookup::Unavailable
            }
        }
    }

    async fn set_shared(&self, key: &str, value: &[u8]) {
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.set(key, value, self.settings.shared_ttl).await {
                self.degrade(CacheTier::Shared, &e.to_string());
            }
        }
    }

    fn degrade(&self, tier: CacheTier, message: &str) {
        bump(&self.counters.degraded);
        warn!("⚠️ 缓存层 {} 不可用，降级处理: {}", tier.name(), message);
        self.errors.record(
            Component::CacheManager,
            ErrorKind::CacheUnavailable,
            format!("{}: {}", tier.name(), message),
        );
    }
}
