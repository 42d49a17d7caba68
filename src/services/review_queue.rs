//! 复核队列 - 业务能力层
//!
//! 只负责"记录需要人工复核的条目"能力，不关心流程。
//! 条目同时保存在内存里，并追加写入 JSON Lines 文件（配置了路径时）。

use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::FileError;
use crate::models::{BoundaryDetectionResult, ReviewItem, ReviewSource};

/// 复核队列
///
/// 职责：
/// - 接收低置信度的边界和评分结果
/// - 不决定什么需要复核，阈值由调用方判断
pub struct ReviewQueue {
    path: Option<String>,
    items: Mutex<Vec<ReviewItem>>,
}

impl ReviewQueue {
    /// 只保存在内存中
    pub fn in_memory() -> Self {
        Self {
            path: None,
            items: Mutex::new(Vec::new()),
        }
    }

    /// 同时追加写入文件
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            items: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, item: ReviewItem) -> Result<(), FileError> {
        debug!(
            "加入复核队列: {} | {} | 置信度 {:.2}",
            item.submission_id, item.student_key, item.confidence
        );

        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(item.clone());

        if let Some(path) = &self.path {
            let line = serde_json::to_string(&item).map_err(|e| FileError::WriteFailed {
                path: path.clone(),
                source: std::io::Error::other(e),
            })?;

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|source| FileError::WriteFailed {
                    path: path.clone(),
                    source,
                })?;
            file.write_all(format!("{}\n", line).as_bytes())
                .await
                .map_err(|source| FileError::WriteFailed {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// 把需要确认的边界逐个加入队列，返回加入的数量
    pub async fn push_boundaries(
        &self,
        submission_id: &str,
        detection: &BoundaryDetectionResult,
    ) -> usize {
        let mut pushed = 0;
        for boundary in detection.needing_confirmation() {
            let item = ReviewItem::new(
                ReviewSource::Boundary,
                submission_id,
                &boundary.student_key,
                boundary.confidence,
                format!(
                    "边界置信度偏低（第 {}-{} 页，{:?}）",
                    boundary.start_page, boundary.end_page, boundary.detection_method
                ),
            );
            match self.push(item).await {
                Ok(()) => pushed += 1,
                Err(e) => warn!("写入复核队列失败: {}", e),
            }
        }
        pushed
    }

    pub fn snapshot(&self) -> Vec<ReviewItem> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReviewQueue {
    fn default() -> Self {
        Self::in_memory()
    }
}
