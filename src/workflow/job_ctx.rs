//! 评分任务上下文
//!
//! 封装"我正在给哪份提交、哪个批次里的哪个学生评分"这一信息

use std::fmt::Display;

/// 评分任务上下文
#[derive(Debug, Clone)]
pub struct JobCtx {
    pub submission_id: String,

    pub batch_id: String,

    pub student_key: String,

    /// 学生在批次中的序号（从1开始，仅用于日志显示）
    pub position: usize,
}

impl JobCtx {
    pub fn new(
        submission_id: impl Into<String>,
        batch_id: impl Into<String>,
        student_key: impl Into<String>,
        position: usize,
    ) -> Self {
        Self {
            submission_id: submission_id.into(),
            batch_id: batch_id.into(),
            student_key: student_key.into(),
            position,
        }
    }
}

impl Display for JobCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[批次 {} 学生#{} {}]",
            self.batch_id, self.position, self.student_key
        )
    }
}
