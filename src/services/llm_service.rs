//! LLM 服务 - 业务能力层
//!
//! 只负责"调用推理服务"能力，不关心流程
//!
//! ## 技术栈
//! - 普通生成使用 `async-openai` crate（兼容 OpenAI API 的服务，如 Gemini, Doubao 等）
//! - 服务端上下文缓存（`cachedContents`）以及带缓存句柄的生成使用 `reqwest` 直接调用

use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::infrastructure::{ContextHandle, GenerationRequest, InferenceProvider};

const PROVIDER: &str = "llm";

/// LLM 服务
///
/// 职责：
/// - 调用 LLM API 生成评分结果
/// - 管理服务端上下文缓存
/// - 不认识学生、批次或评分细则
pub struct LlmService {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    api_key: String,
    /// OpenAI 兼容端点
    api_base: String,
    /// 原生 REST 端点（`cachedContents` 所在位置）
    native_base: String,
    model_name: String,
    min_cacheable_tokens: usize,
}

/// `cachedContents` 接口的返回
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedContent {
    name: String,
    expire_time: DateTime<Utc>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    total_token_count: usize,
}

impl From<CachedContent> for ContextHandle {
    fn from(cached: CachedContent) -> Self {
        ContextHandle {
            name: cached.name,
            expires_at: cached.expire_time,
            token_count: cached
                .usage_metadata
                .map(|u| u.total_token_count)
                .unwrap_or_default(),
        }
    }
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(config: &Config) -> Result<Self, ProviderError> {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        let http = reqwest::Client::builder()
            .timeout(config.provider_timeout())
            .build()
            .map_err(|e| ProviderError::Rejected {
                provider: PROVIDER.to_string(),
                message: e.to_string(),
            })?;

        let api_base = config.llm_api_base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client: Client::with_config(openai_config),
            http,
            api_key: config.llm_api_key.clone(),
            native_base: native_base(&api_base),
            api_base,
            model_name: config.llm_model_name.clone(),
            min_cacheable_tokens: config.context_cache_min_tokens,
        })
    }

    /// 不带缓存句柄的普通生成
    async fn chat(&self, system: Option<&str>, user_message: &str) -> Result<String, ProviderError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let mut messages = Vec::new();

        if let Some(sys_msg) = system {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(rejected)?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(rejected)?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(2048u32)
            .build()
            .map_err(rejected)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            classify_openai_error(e)
        })?;

        debug!("LLM API 调用成功");

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: "LLM 返回内容为空".to_string(),
            })
    }

    /// 带服务端缓存句柄的生成
    async fn chat_with_cache(
        &self,
        cached_content: &str,
        system: Option<&str>,
        user_message: &str,
    ) -> Result<String, ProviderError> {
        debug!("调用 LLM API（缓存 {}），模型: {}", cached_content, self.model_name);

        let body = chat_body(&self.model_name, system, user_message, Some(cached_content));
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), text));
        }

        let value: serde_json::Value = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: e.to_string(),
            }
        })?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: "LLM 返回内容为空".to_string(),
            })
    }

    fn cached_contents_url(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}/{}", self.native_base, name),
            None => format!("{}/cachedContents", self.native_base),
        }
    }
}

#[async_trait]
impl InferenceProvider for LlmService {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn min_cacheable_tokens(&self) -> usize {
        self.min_cacheable_tokens
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let system = match (&request.system, &request.inline_context) {
            (Some(system), Some(inline)) => Some(format!("{}\n\n{}", system, inline)),
            (Some(system), None) => Some(system.clone()),
            (None, inline) => inline.clone(),
        };

        match &request.context {
            Some(handle) => {
                self.chat_with_cache(&handle.name, system.as_deref(), &request.prompt)
                    .await
            }
            None => self.chat(system.as_deref(), &request.prompt).await,
        }
    }

    async fn create_context_cache(
        &self,
        content: &str,
        ttl: Duration,
    ) -> Result<ContextHandle, ProviderError> {
        let body = json!({
            "model": format!("models/{}", self.model_name),
            "contents": [{ "role": "user", "parts": [{ "text": content }] }],
            "ttl": format!("{}s", ttl.as_secs()),
        });

        let response = self
            .http
            .post(self.cached_contents_url(None))
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), text));
        }

        let cached: CachedContent = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: e.to_string(),
            }
        })?;
        Ok(cached.into())
    }

    async fn get_context_cache(&self, name: &str) -> Result<Option<ContextHandle>, ProviderError> {
        let response = self
            .http
            .get(self.cached_contents_url(Some(name)))
            .query(&[("key", &self.api_key)])
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), text));
        }

        let cached: CachedContent = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: e.to_string(),
            }
        })?;
        Ok(Some(cached.into()))
    }

    async fn delete_context_cache(&self, name: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.cached_contents_url(Some(name)))
            .query(&[("key", &self.api_key)])
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), text))
        }
    }
}

/// OpenAI 兼容端点 `.../v1beta/openai` 对应的原生端点 `.../v1beta`
fn native_base(api_base: &str) -> String {
    api_base
        .trim_end_matches('/')
        .trim_end_matches("/openai")
        .to_string()
}

fn chat_body(
    model: &str,
    system: Option<&str>,
    user_message: &str,
    cached_content: Option<&str>,
) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": user_message }));

    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": 0.0,
    });
    if let Some(name) = cached_content {
        body["extra_body"] = json!({ "google": { "cached_content": name } });
    }
    body
}

fn rejected(err: OpenAIError) -> ProviderError {
    ProviderError::Rejected {
        provider: PROVIDER.to_string(),
        message: err.to_string(),
    }
}

fn transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: PROVIDER.to_string(),
            timeout_ms: 0,
        }
    } else {
        ProviderError::Transient {
            provider: PROVIDER.to_string(),
            message: err.to_string(),
        }
    }
}

/// 按 HTTP 状态码区分可重试与不可重试
fn classify_status(status: u16, body: String) -> ProviderError {
    let provider = PROVIDER.to_string();
    match status {
        429 => ProviderError::RateLimited { provider },
        500..=599 | 408 => ProviderError::Transient {
            provider,
            message: format!("HTTP {}: {}", status, body),
        },
        _ => ProviderError::Rejected {
            provider,
            message: format!("HTTP {}: {}", status, body),
        },
    }
}

fn classify_openai_error(err: OpenAIError) -> ProviderError {
    let message = err.to_string();
    match err {
        OpenAIError::Reqwest(_) => ProviderError::Transient {
            provider: PROVIDER.to_string(),
            message,
        },
        OpenAIError::ApiError(_) => {
            let lowered = message.to_lowercase();
            if lowered.contains("rate limit") || lowered.contains("429") {
                ProviderError::RateLimited {
                    provider: PROVIDER.to_string(),
                }
            } else if ["500", "502", "503", "504", "overloaded", "unavailable", "internal"]
                .iter()
                .any(|marker| lowered.contains(marker))
            {
                ProviderError::Transient {
                    provider: PROVIDER.to_string(),
                    message,
                }
            } else {
                ProviderError::Rejected {
                    provider: PROVIDER.to_string(),
                    message,
                }
            }
        }
        _ =>ProviderError::Rejected {
            provider: PROVIDER.to_string(),
            message,
        },
    }
}
