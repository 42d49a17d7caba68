//! 单个学生的评分流程 - 流程层
//!
//! 流程顺序：
//! 1. 查缓存（`grade:<sha256(rubric_hash + content)>`）
//! 2. 未命中 → 组装请求 → 调用推理服务（带超时）
//! 3. 临时故障按退避策略重试，其余错误立即失败
//! 4. 解析返回的 JSON，写回缓存

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheManager};
use crate::config::Config;
use crate::error::{CacheError, Component, ErrorKind, ErrorLog, ProviderError};
use crate::infrastructure::{ContextHandle, GenerationRequest, InferenceProvider};
use crate::models::{CompressedRubricPackage, CriterionAward, GradingOutcome, Points};
use crate::utils::truncate_text;
use crate::workflow::job_ctx::JobCtx;
use crate::workflow::retry::RetryPolicy;

const SYSTEM_PROMPT: &str = "你是一名严格、公正的阅卷老师。只依据给出的评分细则给分，\
不要臆测学生没有写出的内容。只输出 JSON，不要输出其他内容。";

/// 一个批次内所有学生共用的评分上下文
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub package: CompressedRubricPackage,
    /// `render_prompt_context()` 的结果
    pub rubric_text: String,
    /// 服务端上下文缓存句柄；没有时评分细则随请求内联发送
    pub handle: Option<ContextHandle>,
}

/// 评分成功
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSuccess {
    pub outcome: GradingOutcome,
    /// 实际调用推理服务的次数，命中缓存时为 0
    pub attempts: u32,
}

/// 评分失败
#[derive(Debug, Clone, PartialEq)]
pub struct FlowFailure {
    pub error: ProviderError,
    pub attempts: u32,
}

impl From<CacheError> for FlowFailure {
    fn from(err: CacheError) -> Self {
        FlowFailure {
            error: ProviderError::InvalidResponse {
                message: err.to_string(),
            },
            attempts: 0,
        }
    }
}

/// 评分流程
///
/// - 决定何时查缓存、何时调用、何时重试
/// - 不持有批次或并发控制
pub struct GradingFlow {
    provider: Arc<dyn InferenceProvider>,
    cache: Arc<CacheManager>,
    errors: Arc<ErrorLog>,
    retry: RetryPolicy,
    call_timeout: Duration,
    verbose_logging: bool,
}

impl GradingFlow {
    pub fn new(
        config: &Config,
        provider: Arc<dyn InferenceProvider>,
        cache: Arc<CacheManager>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            provider,
            cache,
            errors,
            retry: RetryPolicy::from(config),
            call_timeout: config.provider_timeout(),
            verbose_logging: config.verbose_logging,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn run(
        &self,
        ctx: &JobCtx,
        batch: &BatchContext,
        content: &str,
    ) -> Result<FlowSuccess, FlowFailure> {
        if self.verbose_logging {
            debug!("{} 作答预览: {}", ctx, truncate_text(content, 80));
        }

        let key = grade_cache_key(&batch.package.rubric_hash, content);
        let attempts = AtomicU32::new(0);

        // 缓存中解码失败的条目会被丢弃并重新评分
        let outcome: GradingOutcome = self
            .cache
            .get_or_compute_decoded(
                &key,
                |bytes| serde_json::from_slice(bytes).map_err(CacheError::from),
                || async {
                    self.grade_with_retry(ctx, batch, content, &attempts)
                        .await
                        .and_then(|outcome| {
                            serde_json::to_vec(&outcome).map_err(|e| FlowFailure {
                                error: ProviderError::InvalidResponse {
                                    message: e.to_string(),
                                },
                                attempts: attempts.load(Ordering::SeqCst),
                            })
                        })
                },
            )
            .await?;

        let attempts = attempts.load(Ordering::SeqCst);
        if attempts == 0 {
            info!("{} ♻️ 命中评分缓存", ctx);
        }
        Ok(FlowSuccess { outcome, attempts })
    }

    async fn grade_with_retry(
        &self,
        ctx: &JobCtx,
        batch: &BatchContext,
        content: &str,
        attempts: &AtomicU32,
    ) -> Result<GradingOutcome, FlowFailure> {
        let request = build_request(batch, content);
        let mut attempt = 0;

        loop {
            attempt += 1;
            attempts.store(attempt, Ordering::SeqCst);

            let result = match timeout(self.call_timeout, self.provider.generate(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    provider: self.provider.name().to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                }),
            };

            let error = match result.and_then(|text| parse_outcome(&text, &batch.package)) {
                Ok(outcome) => {
                    info!(
                        "{} ✓ 得分 {}/{}（置信度 {:.2}）",
                        ctx, outcome.score, outcome.max_score, outcome.confidence
                    );
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                warn!("{} ❌ 评分失败（不可重试）: {}", ctx, error);
                return Err(FlowFailure { error, attempts: attempt });
            }

            self.errors.record(
                Component::GradingDispatcher,
                ErrorKind::ProviderTransientFailure,
                format!("{} 第 {} 次: {}", ctx, attempt, error),
            );

            if !self.retry.should_retry(attempt) {
                warn!("{} ❌ 评分失败，已尝试 {} 次: {}", ctx, attempt, error);
                return Err(FlowFailure { error, attempts: attempt });
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                "{} 推理服务临时故障 (尝试 {}/{}), 等待 {}ms 后重试: {}",
                ctx,
                attempt,
                self.retry.max_attempts,
                delay.as_millis(),
                error
            );
            sleep(delay).await;
        }
    }
}

/// 评分结果的缓存键
pub fn grade_cache_key(rubric_hash: &str, content: &str) -> String {
    let mut bytes = Vec::with_capacity(rubric_hash.len() + content.len());
    bytes.extend_from_slice(rubric_hash.as_bytes());
    bytes.extend_from_slice(content.as_bytes());
    cache_key("grade", &bytes)
}

fn build_request(batch: &BatchContext, content: &str) -> GenerationRequest {
    let ids: Vec<&str> = batch.package.criteria.iter().map(|c| c.id.as_str()).collect();
    let prompt = format!(
        r#"请根据评分细则给下面的学生作答评分。

【学生作答】
{}

【输出格式】
{{"score": 总分, "confidence": 0到1之间的把握程度, "criteria": [{{"id": "评分项id", "awarded": 得分}}], "feedback": "简短评语"}}
评分项 id 只能是: {}
总分不能超过 {}。"#,
        content,
        ids.join(", "),
        batch.package.total_points
    );

    GenerationRequest {
        system: Some(SYSTEM_PROMPT.to_string()),
        prompt,
        context: batch.handle.clone(),
        inline_context: match batch.handle {
            Some(_) => None,
            None => Some(batch.rubric_text.clone()),
        },
    }
}

#[derive(Debug, Deserialize)]
struct RawOutcome {
    score: f64,
    confidence: f64,
    #[serde(default)]
    criteria: Vec<RawAward>,
    #[serde(default)]
    feedback: String,
}

#[derive(Debug, Deserialize)]
struct RawAward {
    id: String,
    awarded: f64,
}

/// 从返回文本中取出 JSON（允许 ```json 代码块包裹）
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

fn clamp_points(value: f64, max: Points) -> Result<Points, ProviderError> {
    if !value.is_finite() {
        return Err(ProviderError::InvalidResponse {
            message: format!("分数不是有限数: {}", value),
        });
    }
    // 模型给出的分数可能带更多小数位，先取到 0.01 分
    let rounded = (value.clamp(0.0, max.as_f64()) * 100.0).round() / 100.0;
    Points::try_from(rounded).map_err(|e| ProviderError::InvalidResponse {
        message: e.to_string(),
    })
}

/// 解析推理服务返回的评分 JSON；分数截断到 [0, 满分]
pub fn parse_outcome(
    text: &str,
    package: &CompressedRubricPackage,
) -> Result<GradingOutcome, ProviderError> {
    let raw: RawOutcome =
        serde_json::from_str(extract_json(text)).map_err(|e| ProviderError::InvalidResponse {
            message: format!("{}: {}", e, truncate_text(text, 60)),
        })?;

    if !raw.confidence.is_finite() {
        return Err(ProviderError::InvalidResponse {
            message: "置信度不是有限数".to_string(),
        });
    }

    let mut criteria = Vec::new();
    for award in raw.criteria {
        match package.criteria.iter().find(|c| c.id == award.id) {
            Some(criterion) => criteria.push(CriterionAward {
                awarded: clamp_points(award.awarded, criterion.points)?,
                criterion_id: award.id,
            }),
            None => debug!("忽略未知评分项: {}", award.id),
        }
    }

    Ok(GradingOutcome {
        score: clamp_points(raw.score, package.total_points)?,
        max_score: package.total_points,
        confidence: raw.confidence.clamp(0.0, 1.0),
        criteria,
        feedback: raw.feedback,
    })
}
