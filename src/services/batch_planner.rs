//! 分批规划 - 业务能力层
//!
//! 把按页序排列的学生列表切成连续的批次：
//! `batch_size = min(max_batch_size, max(1, ceil(N / max_parallel_batches)))`
//!
//! 当 `max_batch_size` 小于 `ceil(N / max_parallel_batches)` 时，批次数会超过并行上限，
//! 这是有意的取舍：单批大小上限优先于并行上限。

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Component, PlanningError};
use crate::models::{Batch, StudentRef};
use crate::services::Stage;

/// 分批参数
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerSettings {
    pub max_batch_size: usize,
    pub max_parallel_batches: usize,
    pub per_student_cost: f64,
    /// 单批 token 预算，超出只告警
    pub max_batch_tokens: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_parallel_batches: 3,
            per_student_cost: 1.0,
            max_batch_tokens: 120_000,
        }
    }
}

impl From<&Config> for PlannerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_parallel_batches: config.max_parallel_batches,
            per_student_cost: config.per_student_cost,
            max_batch_tokens: config.max_batch_tokens,
        }
    }
}

/// 分批输入
#[derive(Debug, Clone)]
pub struct PlanningInput {
    pub submission_id: String,
    pub students: Vec<StudentRef>,
}

impl PlanningInput {
    pub fn new(submission_id: impl Into<String>, students: Vec<StudentRef>) -> Self {
        Self {
            submission_id: submission_id.into(),
            students,
        }
    }
}

/// 分批规划器
#[derive(Debug, Clone, Default)]
pub struct BatchPlanner {
    settings: PlannerSettings,
}

impl BatchPlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// 计算单批大小
    pub fn batch_size(&self, student_count: usize) -> Result<usize, PlanningError> {
        self.validate(student_count)?;
        let per_parallel = student_count.div_ceil(self.settings.max_parallel_batches);
        Ok(self.settings.max_batch_size.min(per_parallel.max(1)))
    }

    pub fn plan(&self, input: &PlanningInput) -> Result<Vec<Batch>, PlanningError> {
        let batch_size = self.batch_size(input.students.len())?;

        let batches: Vec<Batch> = input
            .students
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| Batch {
                batch_id: format!("{}-b{:03}", input.submission_id, index),
                students: chunk.to_vec(),
                estimated_cost: chunk.len() as f64 * self.settings.per_student_cost,
                parallel_priority: index,
            })
            .collect();

        if batches.len() > self.settings.max_parallel_batches {
            warn!(
                "批次数 {} 超过并行上限 {}（单批上限 {} 优先）",
                batches.len(),
                self.settings.max_parallel_batches,
                self.settings.max_batch_size
            );
        }

        for batch in &batches {
            let tokens = batch.estimated_tokens();
            if tokens > self.settings.max_batch_tokens {
                warn!(
                    "批次 {} 预估 {} tokens，超出预算 {}",
                    batch.batch_id, tokens, self.settings.max_batch_tokens
                );
            }
        }

        info!(
            "分批完成: {} 名学生 → {} 个批次（每批最多 {} 人）",
            input.students.len(),
            batches.len(),
            batch_size
        );

        Ok(batches)
    }

    fn validate(&self, student_count: usize) -> Result<(), PlanningError> {
        if self.settings.max_batch_size == 0 {
            return Err(PlanningError::ZeroBatchSize);
        }
        if self.settings.max_parallel_batches == 0 {
            return Err(PlanningError::ZeroParallelism);
        }
        if student_count == 0 {
            return Err(PlanningError::NoStudents);
        }
        Ok(())
    }
}

impl Stage for BatchPlanner {
    const COMPONENT: Component = Component::BatchPlanner;
    type Input = PlanningInput;
    type Output = Vec<Batch>;
    type Error = PlanningError;

    fn run(&self, input: &PlanningInput) -> Result<Vec<Batch>, PlanningError> {
        self.plan(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn students(n: usize) -> Vec<StudentRef> {
        (0..n)
            .map(|i| StudentRef {
                student_key: format!("student-{:03}", i + 1),
                start_page: i * 2,
                end_page: i * 2 + 1,
                estimated_tokens: 2400,
            })
            .collect()
    }

    fn planner(max_batch_size: usize, max_parallel_batches: usize) -> BatchPlanner {
        BatchPlanner::new(PlannerSettings {
            max_batch_size,
            max_parallel_batches,
            per_student_cost: 2.5,
            ..PlannerSettings::default()
        })
    }

    #[test]
    fn test_twenty_three_students_three_parallel() {
        let batches = planner(10, 3)
            .plan(&PlanningInput::new("exam", students(23)))
            .unwrap();
        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![8, 8, 7]);
        assert_eq!(batches[0].batch_id, "exam-b000");
        assert_eq!(batches[2].parallel_priority, 2);
        assert_eq!(batches[2].estimated_cost, 17.5);
        assert_eq!(batches[1].students[0].student_key, "student-009");
    }

    #[test]
    fn test_size_cap_wins_over_parallel_cap() {
        let batches = planner(4, 2)
            .plan(&PlanningInput::new("exam", students(20)))
            .unwrap();
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_fewer_students_than_parallel_slots() {
        let batches = planner(10, 8)
            .plan(&PlanningInput::new("exam", students(3)))
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn test_invalid_inputs_fail_fast() {
        let input = PlanningInput::new("exam", students(5));
        assert_eq!(planner(0, 3).plan(&input), Err(PlanningError::ZeroBatchSize));
        assert_eq!(planner(3, 0).plan(&input), Err(PlanningError::ZeroParallelism));
        assert_eq!(
            planner(3, 3).plan(&PlanningInput::new("exam", Vec::new())),
            Err(PlanningError::NoStudents)
        );
    }

    #[test]
    fn test_planning_properties_over_grid() {
        for n in 1..=40 {
            for s in 1..=12 {
                for p in 1..=6 {
                    let batches = planner(s, p)
                        .plan(&PlanningInput::new("g", students(n)))
                        .unwrap();
                    let total: usize = batches.iter().map(Batch::len).sum();
                    assert_eq!(total, n);
                    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= s));
                    if n.div_ceil(p) <= s {
                        assert!(batches.len() <= p, "n={} s={} p={}", n, s, p);
                    }
                    let order: Vec<_> = batches
                        .iter()
                        .flat_map(|b| b.students.iter().map(|st| st.start_page))
                        .collect();
                    assert!(order.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }
}
