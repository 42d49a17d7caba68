use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// 批次取消策略
///
/// - `Drain`: 停止派发新任务，已在执行的任务允许完成
/// - `Abort`: 停止派发新任务，并中断正在执行的任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    #[default]
    Drain,
    Abort,
}

impl FromStr for CancelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(CancelPolicy::Drain),
            "abort" => Ok(CancelPolicy::Abort),
            other => Err(format!("未知的取消策略: {}", other)),
        }
    }
}

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    // --- 分批配置 ---
    /// 每个批次最多包含的学生数量
    pub max_batch_size: usize,
    /// 同时运行的批次数量上限
    pub max_parallel_batches: usize,
    /// 每个批次内同时评分的学生数量
    pub workers_per_batch: usize,
    /// 每个学生的预估成本
    pub per_student_cost: f64,
    /// 每页的预估 token 数
    pub tokens_per_page: usize,
    /// 单个批次的 token 预算（超出时只告警）
    pub max_batch_tokens: usize,

    // --- 边界识别配置 ---
    /// 低于该置信度的边界需要人工确认
    pub boundary_confidence_threshold: f64,
    /// 身份识别信号的最低置信度
    pub identity_signal_floor: f64,
    pub identity_weight: f64,
    pub continuity_weight: f64,
    pub sharpness_weight: f64,

    // --- 评分细则压缩配置 ---
    pub description_max_chars: usize,
    pub max_keywords: usize,

    // --- 缓存配置 ---
    pub local_cache_ttl_secs: u64,
    pub local_cache_capacity: usize,
    pub shared_cache_ttl_secs: u64,
    /// 共享缓存服务地址，未配置时使用进程内实现
    pub shared_cache_url: Option<String>,
    pub context_cache_ttl_secs: u64,
    /// 服务端上下文缓存的最小 token 数
    pub context_cache_min_tokens: usize,
    pub warmup_lookback_days: i64,
    pub warmup_min_confidence: f64,
    pub warmup_batch_size: usize,
    /// 历史评分结果（JSON Lines），用于启动预热
    pub durable_store_path: Option<String>,

    // --- 派发配置 ---
    /// 低于该置信度的评分结果进入复核队列
    pub review_confidence_threshold: f64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub provider_timeout_secs: u64,
    pub cancel_policy: CancelPolicy,

    // --- 文件配置 ---
    /// 待处理提交文件（TOML）存放目录
    pub submission_folder: String,
    /// 评分结果输出目录
    pub results_folder: String,
    /// 复核队列输出文件
    pub review_file: String,
    /// 输出日志文件
    pub output_log_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,

    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_parallel_batches: 3,
            workers_per_batch: 4,
            per_student_cost: 1.0,
            tokens_per_page: 1200,
            max_batch_tokens: 120_000,
            boundary_confidence_threshold: 0.8,
            identity_signal_floor: 0.6,
            identity_weight: 1.0,
            continuity_weight: 1.0,
            sharpness_weight: 1.0,
            description_max_chars: 50,
            max_keywords: 5,
            local_cache_ttl_secs: 300,
            local_cache_capacity: 1024,
            shared_cache_ttl_secs: 3600,
            shared_cache_url: None,
            context_cache_ttl_secs: 3600,
            context_cache_min_tokens: 4096,
            warmup_lookback_days: 7,
            warmup_min_confidence: 0.9,
            warmup_batch_size: 100,
            durable_store_path: None,
            review_confidence_threshold: 0.7,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            provider_timeout_secs: 60,
            cancel_policy: CancelPolicy::Drain,
            submission_folder: "submissions".to_string(),
            results_folder: "results".to_string(),
            review_file: "review.jsonl".to_string(),
            output_log_file: "grading_log.txt".to_string(),
            verbose_logging: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            llm_model_name: "gemini-2.5-flash".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_batch_size: env_or("MAX_BATCH_SIZE", default.max_batch_size),
            max_parallel_batches: env_or("MAX_PARALLEL_BATCHES", default.max_parallel_batches),
            workers_per_batch: env_or("WORKERS_PER_BATCH", default.workers_per_batch),
            per_student_cost: env_or("PER_STUDENT_COST", default.per_student_cost),
            tokens_per_page: env_or("TOKENS_PER_PAGE", default.tokens_per_page),
            max_batch_tokens: env_or("MAX_BATCH_TOKENS", default.max_batch_tokens),
            boundary_confidence_threshold: env_or("BOUNDARY_CONFIDENCE_THRESHOLD", default.boundary_confidence_threshold),
            identity_signal_floor: env_or("IDENTITY_SIGNAL_FLOOR", default.identity_signal_floor),
            identity_weight: env_or("IDENTITY_WEIGHT", default.identity_weight),
            continuity_weight: env_or("CONTINUITY_WEIGHT", default.continuity_weight),
            sharpness_weight: env_or("SHARPNESS_WEIGHT", default.sharpness_weight),
            description_max_chars: env_or("DESCRIPTION_MAX_CHARS", default.description_max_chars),
            max_keywords: env_or("MAX_KEYWORDS", default.max_keywords),
            local_cache_ttl_secs: env_or("LOCAL_CACHE_TTL_SECS", default.local_cache_ttl_secs),
            local_cache_capacity: env_or("LOCAL_CACHE_CAPACITY", default.local_cache_capacity),
            shared_cache_ttl_secs: env_or("SHARED_CACHE_TTL_SECS", default.shared_cache_ttl_secs),
            shared_cache_url: std::env::var("SHARED_CACHE_URL").ok().or(default.shared_cache_url),
            context_cache_ttl_secs: env_or("CONTEXT_CACHE_TTL_SECS", default.context_cache_ttl_secs),
            context_cache_min_tokens: env_or("CONTEXT_CACHE_MIN_TOKENS", default.context_cache_min_tokens),
            warmup_lookback_days: env_or("WARMUP_LOOKBACK_DAYS", default.warmup_lookback_days),
            warmup_min_confidence: env_or("WARMUP_MIN_CONFIDENCE", default.warmup_min_confidence),
            warmup_batch_size: env_or("WARMUP_BATCH_SIZE", default.warmup_batch_size),
            durable_store_path: std::env::var("DURABLE_STORE_PATH").ok().or(default.durable_store_path),
            review_confidence_threshold: env_or("REVIEW_CONFIDENCE_THRESHOLD", default.review_confidence_threshold),
            max_attempts: env_or("MAX_ATTEMPTS", default.max_attempts),
            backoff_base_ms: env_or("BACKOFF_BASE_MS", default.backoff_base_ms),
            backoff_max_ms: env_or("BACKOFF_MAX_MS", default.backoff_max_ms),
            provider_timeout_secs: env_or("PROVIDER_TIMEOUT_SECS", default.provider_timeout_secs),
            cancel_policy: env_or("CANCEL_POLICY", default.cancel_policy),
            submission_folder: std::env::var("SUBMISSION_FOLDER").unwrap_or(default.submission_folder),
            results_folder: std::env::var("RESULTS_FOLDER").unwrap_or(default.results_folder),
            review_file: std::env::var("REVIEW_FILE").unwrap_or(default.review_file),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            verbose_logging: env_or("VERBOSE_LOGGING", default.verbose_logging),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

/// 读取环境变量，不存在时使用默认值；解析失败时告警并使用默认值
fn env_or<T: FromStr>(var_name: &str, default: T) -> T {
    match std::env::var(var_name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                let err = ConfigError::EnvVarParseFailed {
                    var_name: var_name.to_string(),
                    value,
                    expected_type: std::any::type_name::<T>().to_string(),
                };
                warn!("{}，使用默认值", err);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_policy_parse() {
        assert_eq!("drain".parse::<CancelPolicy>().unwrap(), CancelPolicy::Drain);
        assert_eq!(" ABORT ".parse::<CancelPolicy>().unwrap(), CancelPolicy::Abort);
        assert!("later".parse::<CancelPolicy>().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_parse_failure() {
        std::env::set_var("BATCH_GRADING_TEST_BAD_USIZE", "not-a-number");
        assert_eq!(env_or("BATCH_GRADING_TEST_BAD_USIZE", 7usize), 7);
        assert_eq!(env_or("BATCH_GRADING_TEST_MISSING", 3usize), 3);
    }
}
