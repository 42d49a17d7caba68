use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::rubric::Points;

/// 评分任务状态：queued → running → {completed | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// 单个评分项的得分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionAward {
    pub criterion_id: String,
    pub awarded: Points,
}

/// 推理服务给出的评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub score: Points,
    pub max_score: Points,
    pub confidence: f64,
    #[serde(default)]
    pub criteria: Vec<CriterionAward>,
    #[serde(default)]
    pub feedback: String,
}

/// 单个学生的评分任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingJob {
    pub batch_id: String,
    pub student_key: String,
    pub status: JobStatus,
    pub result: Option<GradingOutcome>,
    pub confidence: Option<f64>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl GradingJob {
    pub fn new(batch_id: impl Into<String>, student_key: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            student_key: student_key.into(),
            status: JobStatus::Queued,
            result: None,
            confidence: None,
            attempts: 0,
            error: None,
        }
    }

    /// 切换状态，非法转换返回 false 且不做任何修改
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn complete(&mut self, outcome: GradingOutcome) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.confidence = Some(outcome.confidence);
        self.result = Some(outcome);
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.error = Some(reason.into());
        true
    }
}

/// 复核来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    Boundary,
    Job,
}

/// 复核队列中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub source: ReviewSource,
    pub submission_id: String,
    pub student_key: String,
    pub confidence: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl ReviewItem {
    pub fn new(
        source: ReviewSource,
        submission_id: impl Into<String>,
        student_key: impl Into<String>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source,
            submission_id: submission_id.into(),
            student_key: student_key.into(),
            confidence,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}
