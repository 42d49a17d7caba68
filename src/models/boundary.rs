use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::batch::StudentRef;

/// 边界识别方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// 身份（姓名 / 学号）变化
    Identity,
    /// 题号循环重置
    Cycle,
    /// 两种信号同时成立
    Hybrid,
}

/// 一个学生在提交中占用的页范围
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentBoundary {
    pub student_key: String,
    pub start_page: usize,
    pub end_page: usize,
    pub confidence: f64,
    pub needs_confirmation: bool,
    pub detection_method: DetectionMethod,
}

impl StudentBoundary {
    /// 覆盖的页数（含首尾）
    pub fn page_count(&self) -> usize {
        self.end_page - self.start_page + 1
    }

    pub fn contains(&self, page_index: usize) -> bool {
        (self.start_page..=self.end_page).contains(&page_index)
    }
}

/// 一次边界识别的完整结果，生成后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryDetectionResult {
    pub boundaries: Vec<StudentBoundary>,
    pub total_students: usize,
    pub unassigned_pages: Vec<usize>,
    pub total_pages: usize,
    pub timestamp: DateTime<Utc>,
}

impl BoundaryDetectionResult {
    pub fn empty() -> Self {
        Self {
            boundaries: Vec::new(),
            total_students: 0,
            unassigned_pages: Vec::new(),
            total_pages: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn needing_confirmation(&self) -> impl Iterator<Item = &StudentBoundary> {
        self.boundaries.iter().filter(|b| b.needs_confirmation)
    }

    /// 按页序生成学生引用列表，作为分批的输入
    pub fn student_refs(&self, tokens_per_page: usize) -> Vec<StudentRef> {
        self.boundaries
            .iter()
            .map(|b| StudentRef {
                student_key: b.student_key.clone(),
                start_page: b.start_page,
                end_page: b.end_page,
                estimated_tokens: b.page_count() * tokens_per_page,
            })
            .collect()
    }
}
