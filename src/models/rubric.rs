//! 评分细则相关数据结构
//!
//! 分值统一以"百分之一分"为单位的整数保存，求和不会产生浮点误差

use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::error::RubricError;

/// 分值（内部以 0.01 分为单位）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Points(u32);

impl Points {
    pub const ZERO: Points = Points(0);

    pub fn from_hundredths(hundredths: u32) -> Self {
        Points(hundredths)
    }

    pub fn hundredths(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    /// 按比例折算，向下取整到 0.01 分
    pub fn scale(self, numerator: usize, denominator: usize) -> Points {
        if denominator == 0 {
            return Points::ZERO;
        }
        let scaled = u64::from(self.0) * numerator as u64 / denominator as u64;
        Points(scaled.min(u64::from(self.0)) as u32)
    }
}

impl TryFrom<f64> for Points {
    type Error = RubricError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let hundredths = (value * 100.0).round();
        // 超过 0.01 分精度的值直接拒绝，不做静默舍入
        let off_grid = (value * 100.0 - hundredths).abs() > 1e-6;
        if !value.is_finite() || value < 0.0 || off_grid || hundredths > f64::from(u32::MAX) {
            return Err(RubricError::InvalidPoints { value });
        }
        Ok(Points(hundredths as u32))
    }
}

impl From<Points> for f64 {
    fn from(points: Points) -> Self {
        points.as_f64()
    }
}

impl Add for Points {
    type Output = Points;

    fn add(self, rhs: Points) -> Points {
        Points(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Points {
    fn sum<I: Iterator<Item = Points>>(iter: I) -> Points {
        iter.fold(Points::ZERO, Add::add)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 100 == 0 {
            write!(f, "{}", self.0 / 100)
        } else {
            write!(f, "{:.2}", self.as_f64())
        }
    }
}

/// 单个评分项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricCriterion {
    pub id: String,
    pub description: String,
    pub points: Points,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub required_elements: Vec<String>,
}

/// 完整展开的评分细则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricUnderstanding {
    pub criteria: Vec<RubricCriterion>,
    #[serde(default)]
    pub total_points: Points,
}

impl RubricUnderstanding {
    pub fn new(criteria: Vec<RubricCriterion>) -> Self {
        let total_points = criteria.iter().map(|c| c.points).sum();
        Self {
            criteria,
            total_points,
        }
    }

    pub fn points_sum(&self) -> Points {
        self.criteria.iter().map(|c| c.points).sum()
    }
}

/// 判分依据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleBasis {
    /// 按必备要素的出现数量给分
    RequiredElements,
    /// 没有必备要素时，命中关键词即给满分
    KeywordHit,
}

/// 分数段：至少出现 `min_present` 个要素时给 `award` 分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBand {
    pub min_present: usize,
    pub award: Points,
}

/// 判分规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRule {
    pub basis: RuleBasis,
    pub required_elements: Vec<String>,
    /// 按 `min_present` 从高到低排列
    pub bands: Vec<ScoreBand>,
}

impl DecisionRule {
    /// 出现 `present` 个要素时应得的分数
    pub fn award_for(&self, present: usize) -> Points {
        self.bands
            .iter()
            .find(|band| present >= band.min_present)
            .map(|band| band.award)
            .unwrap_or(Points::ZERO)
    }

    /// 紧凑的文本形式，例如 `3/3=>4 | 2/3=>2.66 | 0/3=>0`
    pub fn render(&self) -> String {
        let denominator = match self.basis {
            RuleBasis::RequiredElements => self.required_elements.len(),
            RuleBasis::KeywordHit => 1,
        };
        self.bands
            .iter()
            .map(|band| format!("{}/{}=>{}", band.min_present, denominator, band.award))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// 压缩后的评分项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedCriterion {
    pub id: String,
    pub description: String,
    pub points: Points,
    pub keywords: Vec<String>,
    pub quick_check: String,
    pub decision_rule: DecisionRule,
}

/// 压缩评分细则包，所有批次共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedRubricPackage {
    pub batch_id: String,
    /// 原始评分细则规范文本的 SHA-256
    pub rubric_hash: String,
    pub criteria: Vec<CompressedCriterion>,
    pub total_points: Points,
}

impl CompressedRubricPackage {
    pub fn points_sum(&self) -> Points {
        self.criteria.iter().map(|c| c.points).sum()
    }

    /// 绑定到某个批次的副本，除 `batch_id` 外内容不变
    pub fn for_batch(&self, batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            ..self.clone()
        }
    }

    /// 渲染为交给推理服务的上下文文本
    ///
    /// 只依赖评分内容，不包含 `batch_id`，保证各批次的上下文字节一致
    pub fn render_prompt_context(&self) -> String {
        let mut out = format!("RUBRIC {} total={}\n", self.rubric_hash, self.total_points);
        for criterion in &self.criteria {
            out.push_str(&format!(
                "[{}] {} ({}pt)\n  kw: {}\n  {}\n  rule: {}\n",
                criterion.id,
                criterion.description,
                criterion.points,
                criterion.keywords.join(", "),
                criterion.quick_check,
                criterion.decision_rule.render()
            ));
        }
        out
    }
}
