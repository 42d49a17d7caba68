//! 推理服务接口 - 基础设施层
//!
//! 只描述"推理服务能做什么"：生成文本，以及服务端上下文缓存的创建 / 查询 / 删除。
//! 具体实现见 `services::llm_service::LlmService`。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// 服务端上下文缓存的句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHandle {
    pub name: String,
    pub expires_at: DateTime<Utc>,
    pub token_count: usize,
}

impl ContextHandle {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// 一次生成请求
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// 已缓存在服务端的上下文
    pub context: Option<ContextHandle>,
    /// 未能缓存时随请求内联发送的上下文
    pub inline_context: Option<String>,
}

/// 推理服务
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// 服务端上下文缓存接受的最小 token 数
    fn min_cacheable_tokens(&self) -> usize;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    async fn create_context_cache(
        &self,
        content: &str,
        ttl: Duration,
    ) -> Result<ContextHandle, ProviderError>;

    async fn get_context_cache(&self, name: &str) -> Result<Option<ContextHandle>, ProviderError>;

    async fn delete_context_cache(&self, name: &str) -> Result<(), ProviderError>;
}

/// 粗略估算 token 数（约 4 个字符一个 token）
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
