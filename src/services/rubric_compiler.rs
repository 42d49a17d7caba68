//! 评分细则压缩 - 业务能力层
//!
//! 把完整的评分细则压成每个批次都能直接复用的紧凑包：
//! 截断描述、挑选关键词、生成快速检查串和分数段规则。分值逐项原样保留。

use std::collections::HashSet;

use phf::phf_set;
use tracing::{info, warn};

use crate::cache::{CacheManager, ContentHasher};
use crate::config::Config;
use crate::error::{AppError, AppResult, Component, RubricError};
use crate::models::{
    CompressedCriterion, CompressedRubricPackage, DecisionRule, Points, RubricCriterion,
    RubricUnderstanding, RuleBasis, ScoreBand,
};
use crate::services::Stage;
use crate::utils::truncate_text;

/// 不参与关键词排序的停用词（小写）
static STOPWORDS: phf::Set<&'static str> = phf_set! {
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into",
    "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "with",
    "的", "了", "和", "与", "及", "或", "是", "在", "对", "并", "等",
};

/// 压缩参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerSettings {
    pub description_max_chars: usize,
    pub max_keywords: usize,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            description_max_chars: 50,
            max_keywords: 5,
        }
    }
}

impl From<&Config> for CompilerSettings {
    fn from(config: &Config) -> Self {
        Self {
            description_max_chars: config.description_max_chars,
            max_keywords: config.max_keywords,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RubricCompiler {
    settings: CompilerSettings,
}

impl RubricCompiler {
    pub fn new(settings: CompilerSettings) -> Self {
        Self { settings }
    }

    /// 评分细则的规范哈希（SHA-256 hex）
    pub fn rubric_hash(rubric: &RubricUnderstanding) -> Result<String, RubricError> {
        let canonical = ContentHasher::canonical_json(rubric)
            .map_err(|e| RubricError::Serialization(e.to_string()))?;
        Ok(ContentHasher::hash_hex(&canonical))
    }

    /// 编译评分细则；返回的包 `batch_id` 为空，使用时通过 `for_batch` 绑定批次
    pub fn compile(&self, rubric: &RubricUnderstanding) -> Result<CompressedRubricPackage, RubricError> {
        let rubric = validate(rubric)?;
        let rubric_hash = Self::rubric_hash(&rubric)?;

        let criteria: Vec<CompressedCriterion> = rubric
            .criteria
            .iter()
            .map(|criterion| self.compress(criterion))
            .collect();

        let package = CompressedRubricPackage {
            batch_id: String::new(),
            rubric_hash,
            criteria,
            total_points: rubric.total_points,
        };

        info!(
            "📐 评分细则压缩完成: {} 项，总分 {}，哈希 {}",
            package.criteria.len(),
            package.total_points,
            &package.rubric_hash[..12]
        );
        Ok(package)
    }

    /// 经由缓存编译：同一版本的评分细则只编译一次
    pub async fn compile_cached(
        &self,
        rubric: &RubricUnderstanding,
        cache: &CacheManager,
    ) -> AppResult<CompressedRubricPackage> {
        let key = format!("rubric:{}", Self::rubric_hash(&validate(rubric)?)?);
        cache
            .get_or_compute_json(&key, || async { self.compile(rubric).map_err(AppError::from) })
            .await
    }

    fn compress(&self, criterion: &RubricCriterion) -> CompressedCriterion {
        let keywords = self.select_keywords(criterion);
        CompressedCriterion {
            id: criterion.id.clone(),
            description: truncate_text(&criterion.description, self.settings.description_max_chars),
            points: criterion.points,
            quick_check: quick_check(&keywords, &criterion.required_elements),
            decision_rule: decision_rule(criterion),
            keywords,
        }
    }

    /// 按相关度取前 K 个关键词；没有给出关键词时从描述中拆词
    fn select_keywords(&self, criterion: &RubricCriterion) -> Vec<String> {
        let haystack = format!(
            "{} {}",
            criterion.description,
            criterion.required_elements.join(" ")
        )
        .to_lowercase();

        let candidates: Vec<String> = if criterion.keywords.is_empty() {
            criterion
                .description
                .split(|c: char| !c.is_alphanumeric())
                .filter(|word| word.chars().count() >= 2)
                .map(str::to_string)
                .collect()
        } else {
            criterion.keywords.clone()
        };

        let mut seen = HashSet::new();
        let mut scored: Vec<(usize, String)> = candidates
            .into_iter()
            .map(|kw| kw.trim().to_string())
            .filter(|kw| !kw.is_empty())
            .filter(|kw| !STOPWORDS.contains(kw.to_lowercase().as_str()))
            .filter(|kw| seen.insert(kw.to_lowercase()))
            .map(|kw| (haystack.matches(kw.to_lowercase().as_str()).count(), kw))
            .collect();

        // 稳定排序，同分保持原顺序
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.settings.max_keywords)
            .map(|(_, kw)| kw)
            .collect()
    }
}

/// 校验并修正总分
fn validate(rubric: &RubricUnderstanding) -> Result<RubricUnderstanding, RubricError> {
    if rubric.criteria.is_empty() {
        return Err(RubricError::Empty);
    }

    let mut ids = HashSet::new();
    for (index, criterion) in rubric.criteria.iter().enumerate() {
        let id = criterion.id.trim();
        if id.is_empty() {
            return Err(RubricError::MissingId { index });
        }
        if !ids.insert(id) {
            return Err(RubricError::DuplicateId { id: id.to_string() });
        }
    }

    let sum = rubric.points_sum();
    if rubric.total_points != sum {
        warn!(
            "评分细则总分 {} 与各项之和 {} 不一致，已按各项之和修正",
            rubric.total_points, sum
        );
    }
    Ok(RubricUnderstanding {
        criteria: rubric.criteria.clone(),
        total_points: sum,
    })
}

fn quick_check(keywords: &[String], required: &[String]) -> String {
    let check = if keywords.is_empty() {
        "-".to_string()
    } else {
        keywords.join("|")
    };
    let must = if required.is_empty() {
        "-".to_string()
    } else {
        required.join(",")
    };
    format!("check: {} ; must: {}", check, must)
}

fn decision_rule(criterion: &RubricCriterion) -> DecisionRule {
    let required = &criterion.required_elements;
    if required.is_empty() {
        return DecisionRule {
            basis: RuleBasis::KeywordHit,
            required_elements: Vec::new(),
            bands: vec![
                ScoreBand {
                    min_present: 1,
                    award: criterion.points,
                },
                ScoreBand {
                    min_present: 0,
                    award: Points::ZERO,
                },
            ],
        };
    }

    let n = required.len();
    DecisionRule {
        basis: RuleBasis::RequiredElements,
        required_elements: required.clone(),
        bands: (0..=n)
            .rev()
            .map(|present| ScoreBand {
                min_present: present,
                award: criterion.points.scale(present, n),
            })
            .collect(),
    }
}

impl Stage for RubricCompiler {
    const COMPONENT: Component = Component::RubricCompiler;
    type Input = RubricUnderstanding;
    type Output = CompressedRubricPackage;
    type Error = RubricError;

    fn run(&self, input: &RubricUnderstanding) -> Result<CompressedRubricPackage, RubricError> {
        self.compile(input)
    }
}
