use serde::{Deserialize, Serialize};

/// 批次中对某个学生的引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentRef {
    pub student_key: String,
    pub start_page: usize,
    pub end_page: usize,
    pub estimated_tokens: usize,
}

/// 一组一起评分的学生
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub students: Vec<StudentRef>,
    pub estimated_cost: f64,
    /// 数值越小越先执行
    pub parallel_priority: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.students.iter().map(|s| s.estimated_tokens).sum()
    }
}
