//! 第三层：推理服务端的上下文缓存
//!
//! 同一个键只创建一次服务端缓存；低于最小 token 数的内容直接拒绝，由调用方内联发送。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::infrastructure::{estimate_tokens, ContextHandle, InferenceProvider};

pub struct ProviderContextCache {
    provider: Arc<dyn InferenceProvider>,
    ttl: Duration,
    min_tokens: usize,
    handles: Mutex<HashMap<String, ContextHandle>>,
}

impl ProviderContextCache {
    pub fn new(provider: Arc<dyn InferenceProvider>, ttl: Duration, min_tokens: usize) -> Self {
        // 服务端自己的下限更高时以服务端为准
        let min_tokens = min_tokens.max(provider.min_cacheable_tokens());
        Self {
            provider,
            ttl,
            min_tokens,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// 返回可用的句柄，第二个值表示是否命中已有句柄
    pub async fn handle_for(
        &self,
        key: &str,
        content: &str,
    ) -> Result<(ContextHandle, bool), ProviderError> {
        let mut handles = self.handles.lock().await;

        if let Some(known) = handles.get(key).filter(|h| h.is_live(Utc::now())).cloned() {
            match self.provider.get_context_cache(&known.name).await {
                Ok(Some(refreshed)) => {
                    handles.insert(key.to_string(), refreshed.clone());
                    return Ok((refreshed, true));
                }
                Ok(None) => {
                    debug!("服务端缓存 {} 已不存在，重新创建", known.name);
                }
                Err(e) => {
                    warn!("查询服务端缓存 {} 失败，沿用本地句柄: {}", known.name, e);
                    return Ok((known, true));
                }
            }
        }
        handles.remove(key);

        let tokens = estimate_tokens(content);
        if tokens < self.min_tokens {
            return Err(ProviderError::ContentTooSmall {
                tokens,
                min_tokens: self.min_tokens,
            });
        }

        let handle = self.provider.create_context_cache(content, self.ttl).await?;
        info!(
            "🗂️ 已创建服务端上下文缓存 {}（约 {} tokens）",
            handle.name, tokens
        );
        handles.insert(key.to_string(), handle.clone());
        Ok((handle, false))
    }

    /// 删除键对应的服务端缓存，返回是否存在
    pub async fn invalidate(&self, key: &str) -> Result<bool, ProviderError> {
        let removed = self.handles.lock().await.remove(key);
        match removed {
            Some(handle) => {
                self.provider.delete_context_cache(&handle.name).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
