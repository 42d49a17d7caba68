use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 流水线阶段
///
/// 每个阶段是一个显式的类型标签，用于错误记录和日志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    BoundaryDetector,
    BatchPlanner,
    RubricCompiler,
    CacheManager,
    GradingDispatcher,
}

impl Component {
    pub fn name(self) -> &'static str {
        match self {
            Component::BoundaryDetector => "boundary_detector",
            Component::BatchPlanner => "batch_planner",
            Component::RubricCompiler => "rubric_compiler",
            Component::CacheManager => "cache_manager",
            Component::GradingDispatcher => "grading_dispatcher",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 运行期错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 边界置信度低于阈值，需要确认
    DetectionAmbiguous,
    /// 分批参数无效
    PlanningInvalid,
    /// 某一缓存层不可用
    CacheUnavailable,
    /// 上下文内容低于服务端缓存的最小值
    CacheContentTooSmall,
    /// 推理服务的临时故障（网络、5xx、超时）
    ProviderTransientFailure,
    /// 单个学生的评分任务失败
    JobFailed,
    /// 评分细则无法编译
    RubricInvalid,
}

impl ErrorKind {
    /// 是否终止本次运行
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::PlanningInvalid | ErrorKind::RubricInvalid)
    }
}

/// 结构化的运行期错误记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub component: Component,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PipelineError {
    pub fn new(component: Component, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            component,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?}: {} ({})",
            self.component,
            self.kind,
            self.message,
            self.timestamp.to_rfc3339()
        )
    }
}

/// 运行级错误列表
///
/// 只追加，不删除；各阶段并发写入
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<PipelineError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, component: Component, kind: ErrorKind, message: impl Into<String>) {
        self.push(PipelineError::new(component, kind, message));
    }

    pub fn push(&self, error: PipelineError) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(error);
    }

    pub fn snapshot(&self) -> Vec<PipelineError> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn has_fatal(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.kind.is_fatal())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ========== 各阶段的错误类型 ==========

/// 分批规划错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("没有可分批的学生")]
    NoStudents,
    #[error("max_batch_size 必须大于 0")]
    ZeroBatchSize,
    #[error("max_parallel_batches 必须大于 0")]
    ZeroParallelism,
}

/// 评分细则错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RubricError {
    #[error("评分细则没有任何评分项")]
    Empty,
    #[error("第 {index} 个评分项缺少 id")]
    MissingId { index: usize },
    #[error("评分项 id 重复: {id}")]
    DuplicateId { id: String },
    #[error("分值无效: {value}（必须是非负有限数）")]
    InvalidPoints { value: f64 },
    #[error("评分细则序列化失败: {0}")]
    Serialization(String),
}

/// 推理服务错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// 网络错误或 5xx
    #[error("推理服务请求失败 ({provider}): {message}")]
    Transient { provider: String, message: String },
    #[error("推理服务调用超时 ({provider}): {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
    #[error("推理服务请求频率限制 ({provider})")]
    RateLimited { provider: String },
    /// 4xx 等不可重试的错误
    #[error("推理服务拒绝请求 ({provider}): {message}")]
    Rejected { provider: String, message: String },
    #[error("上下文内容过小，无法缓存: {tokens} < {min_tokens} tokens")]
    ContentTooSmall { tokens: usize, min_tokens: usize },
    #[error("推理服务返回内容无法解析: {message}")]
    InvalidResponse { message: String },
}

impl ProviderError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::RateLimited { .. }
        )
    }
}

/// 缓存错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("缓存层 {tier} 不可用: {message}")]
    Unavailable { tier: &'static str, message: String },
    #[error("持久化存储查询失败: {message}")]
    Store { message: String },
    #[error("缓存值序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("分批规划错误: {0}")]
    Planning(#[from] PlanningError),
    #[error("评分细则错误: {0}")]
    Rubric(#[from] RubricError),
    #[error("推理服务错误: {0}")]
    Provider(#[from] ProviderError),
    #[error("缓存错误: {0}")]
    Cache(#[from] CacheError),
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        let provider = err
            .url()
            .and_then(|url| url.host_str())
            .unwrap_or("http")
            .to_string();
        if err.is_timeout() {
            AppError::Provider(ProviderError::Timeout {
                provider,
                timeout_ms: 0,
            })
        } else {
            AppError::Provider(ProviderError::Transient {
                provider,
                message: err.to_string(),
            })
        }
    }
}

impl AppError {
    /// 对应的错误类别（用于写入运行级错误列表）
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AppError::Planning(_) => Some(ErrorKind::PlanningInvalid),
            AppError::Rubric(_) => Some(ErrorKind::RubricInvalid),
            AppError::Provider(e) if e.is_transient() => Some(ErrorKind::ProviderTransientFailure),
            AppError::Provider(ProviderError::ContentTooSmall { .. }) => {
                Some(ErrorKind::CacheContentTooSmall)
            }
            AppError::Cache(_) => Some(ErrorKind::CacheUnavailable),
            _ => None,
        }
    }
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_planning_and_rubric_are_fatal() {
        assert!(ErrorKind::PlanningInvalid.is_fatal());
        assert!(ErrorKind::RubricInvalid.is_fatal());
        assert!(!ErrorKind::JobFailed.is_fatal());
        assert!(!ErrorKind::CacheUnavailable.is_fatal());
        assert!(!ErrorKind::DetectionAmbiguous.is_fatal());
    }

    #[test]
    fn test_error_log_records_every_entry() {
        let log = ErrorLog::new();
        log.record(Component::CacheManager, ErrorKind::CacheUnavailable, "shared tier down");
        log.record(Component::GradingDispatcher, ErrorKind::JobFailed, "student-001");
        log.record(Component::GradingDispatcher, ErrorKind::JobFailed, "student-002");

        assert_eq!(log.len(), 3);
        assert_eq!(log.count(ErrorKind::JobFailed), 2);
        assert!(!log.has_fatal());

        let snapshot = log.snapshot();
        assert_eq!(snapshot[0].component, Component::CacheManager);
        assert_eq!(snapshot[0].message, "shared tier down");
    }

    #[test]
    fn test_provider_error_transience() {
        let timeout = ProviderError::Timeout {
            provider: "llm".into(),
            timeout_ms: 10,
        };
        let rejected = ProviderError::Rejected {
            provider: "llm".into(),
            message: "400".into(),
        };
        assert!(timeout.is_transient());
        assert!(!rejected.is_transient());
        assert_eq!(
            AppError::from(timeout).kind(),
            Some(ErrorKind::ProviderTransientFailure)
        );
    }

    #[test]
    fn test_toml_error_maps_to_file_error() {
        let err = toml::from_str::<toml::Table>("a = = 1").unwrap_err();
        let app_err = AppError::from(err);
        assert!(matches!(
            app_err,
            AppError::File(FileError::TomlParseFailed { .. })
        ));
        assert_eq!(app_err.kind(), None);
    }
}
