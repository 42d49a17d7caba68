//! 持久化存储（只读） - 基础设施层
//!
//! 启动预热时查询近期的高置信度评分结果。写入由下游持久化组件负责。

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CacheError;

/// 一条历史评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorResult {
    /// 与 `CacheManager` 使用的键一致
    pub cache_key: String,
    /// 序列化后的原始值（JSON 文本）
    pub value: String,
    pub confidence: f64,
    pub graded_at: DateTime<Utc>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// 按时间倒序返回 `since` 之后、置信度不低于 `min_confidence` 的结果
    async fn recent_results(
        &self,
        since: DateTime<Utc>,
        min_confidence: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PriorResult>, CacheError>;
}

fn select(
    rows: &[PriorResult],
    since: DateTime<Utc>,
    min_confidence: f64,
    offset: usize,
    limit: usize,
) -> Vec<PriorResult> {
    let mut matching: Vec<&PriorResult> = rows
        .iter()
        .filter(|r| r.graded_at >= since && r.confidence >= min_confidence)
        .collect();
    matching.sort_by(|a, b| b.graded_at.cmp(&a.graded_at));
    matching
        .into_iter()
        .skip(offset)
        .take(limit)
        .cloned()
        .collect()
}

/// 进程内实现
#[derive(Debug, Default, Clone)]
pub struct InMemoryDurableStore {
    rows: Vec<PriorResult>,
}

impl InMemoryDurableStore {
    pub fn new(rows: Vec<PriorResult>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn recent_results(
        &self,
        since: DateTime<Utc>,
        min_confidence: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PriorResult>, CacheError> {
        Ok(select(&self.rows, since, min_confidence, offset, limit))
    }
}

/// JSON Lines 文件实现，每行一个 `PriorResult`
#[derive(Debug, Clone)]
pub struct JsonlDurableStore {
    path: PathBuf,
}

impl JsonlDurableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<PriorResult>, CacheError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CacheError::Store {
                message: format!("{}: {}", self.path.display(), e),
            })?;

        let mut rows = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PriorResult>(line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(
                    "跳过无法解析的历史结果 {}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ),
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl DurableStore for JsonlDurableStore {
    async fn recent_results(
        &self,
        since: DateTime<Utc>,
        min_confidence: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PriorResult>, CacheError> {
        let rows = self.load().await?;
        Ok(select(&rows, since, min_confidence, offset, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(key: &str, confidence: f64, days_ago: i64) -> PriorResult {
        PriorResult {
            cache_key: key.to_string(),
            value: "{}".to_string(),
            confidence,
            graded_at: Utc::now() - Duration::days(days_ago),
        }
    }

    #[tokio::test]
    async fn test_recent_results_filters_and_pages() {
        let store = InMemoryDurableStore::new(vec![
            row("old", 0.99, 30),
            row("low", 0.5, 1),
            row("a", 0.95, 1),
            row("b", 0.95, 2),
            row("c", 0.95, 3),
        ]);
        let since = Utc::now() - Duration::days(7);

        let first = store.recent_results(since, 0.9, 0, 2).await.unwrap();
        let keys: Vec<_> = first.iter().map(|r| r.cache_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let second = store.recent_results(since, 0.9, 2, 2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].cache_key, "c");
    }

    #[tokio::test]
    async fn test_jsonl_store_skips_bad_lines() {
        let path = std::env::temp_dir().join(format!("batch_grading_prior_{}.jsonl", std::process::id()));
        let good = serde_json::to_string(&row("a", 0.95, 1)).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n", good)).unwrap();

        let store = JsonlDurableStore::new(&path);
        let rows = store
            .recent_results(Utc::now() - Duration::days(7), 0.9, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        std::fs::remove_file(&path).unwrap();
        assert!(store.recent_results(Utc::now(), 0.0, 0, 10).await.is_err());
    }
}
