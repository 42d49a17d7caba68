//! 学生边界识别 - 业务能力层
//!
//! 把逐页信号（题号序列、身份候选）合并成学生边界。两种策略独立运行：
//!
//! - **身份策略**：页面的身份候选与当前学生已知身份不同（双方置信度都不低于下限）
//! - **题号循环策略**：页面首个题号不大于当前分组已出现的最大题号（题号"重置"）
//!
//! 每个边界的置信度是可用分量（身份分、连续性分、边界清晰度）的加权平均。
//! 置信度低于阈值只会打上 `needs_confirmation` 标记，从不阻塞流程。

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Component;
use crate::models::{
    BoundaryDetectionResult, DetectionMethod, IdentityCandidate, PageSignal, StudentBoundary,
};
use crate::services::Stage;

/// 行首题号：`1.` `1、` `Q1` `(1)` `第1题`
const QUESTION_NUMBER_PATTERN: &str =
    r"(?m)^\s*(?:第\s*(\d{1,3})\s*题|[QqＱ]\s*(\d{1,3})\b|[(（]\s*(\d{1,3})\s*[)）]|(\d{1,3})\s*[.、．])";

fn question_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(QUESTION_NUMBER_PATTERN).expect("题号正则必须合法"))
}

/// 从页面文本中按出现顺序提取题号
pub fn extract_question_numbers(text: &str) -> Vec<u32> {
    question_number_regex()
        .captures_iter(text)
        .filter_map(|cap| {
            (1..=4)
                .find_map(|i| cap.get(i))
                .and_then(|m| m.as_str().parse::<u32>().ok())
        })
        .collect()
}

/// 置信度各分量的权重
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
    pub identity: f64,
    pub continuity: f64,
    pub sharpness: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            identity: 1.0,
            continuity: 1.0,
            sharpness: 1.0,
        }
    }
}

/// 边界识别参数
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub confidence_threshold: f64,
    /// 身份候选参与判断的最低置信度
    pub identity_floor: f64,
    pub weights: ConfidenceWeights,
    /// 边界页本身出现了身份变化
    pub sharpness_identity_change: f64,
    /// 边界前一页带有不同的身份
    pub sharpness_previous_identity: f64,
    pub sharpness_default: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            identity_floor: 0.6,
            weights: ConfidenceWeights::default(),
            sharpness_identity_change: 0.9,
            sharpness_previous_identity: 0.8,
            sharpness_default: 0.6,
        }
    }
}

impl From<&Config> for DetectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            confidence_threshold: config.boundary_confidence_threshold,
            identity_floor: config.identity_signal_floor,
            weights: ConfidenceWeights {
                identity: config.identity_weight,
                continuity: config.continuity_weight,
                sharpness: config.sharpness_weight,
            },
            ..Self::default()
        }
    }
}

/// 边界识别的输入
#[derive(Debug, Clone, Default)]
pub struct DetectionInput {
    pub pages: Vec<PageSignal>,
}

impl DetectionInput {
    pub fn new(pages: Vec<PageSignal>) -> Self {
        Self { pages }
    }

    /// 按页码排序并去除重复页码，保证页码严格递增
    fn normalized_pages(&self) -> Vec<PageSignal> {
        let mut pages = self.pages.clone();
        pages.sort_by_key(|p| p.page_index);
        pages.dedup_by_key(|p| p.page_index);
        if pages.len() != self.pages.len() {
            debug!(
                "输入页码存在重复，已去重: {} -> {}",
                self.pages.len(),
                pages.len()
            );
        }
        pages
    }
}

/// 正在累积的学生分组
#[derive(Debug)]
struct Group {
    start_page: usize,
    end_page: usize,
    /// 每个有题号页面的 (首题号, 末题号)
    numbered_pages: Vec<(u32, u32)>,
    max_seen: Option<u32>,
    identity: Option<IdentityCandidate>,
    started_by_identity: bool,
    started_by_cycle: bool,
    /// 由题号重置开启（首个分组不是）
    opened_by_reset: bool,
    identity_score: Option<f64>,
    sharpness: f64,
}

/// `next` 紧接在 `prev` 之后
fn follows(prev: u32, next: u32) -> bool {
    prev.checked_add(1) == Some(next)
}

impl Group {
    fn push_numbers(&mut self, numbers: &[u32]) {
        if let (Some(&first), Some(&last)) = (numbers.first(), numbers.last()) {
            self.numbered_pages.push((first, last));
        }
        if let Some(&max) = numbers.iter().max() {
            self.max_seen = Some(self.max_seen.map_or(max, |m| m.max(max)));
        }
    }

    /// 相邻有题号页面中，题号恰好连续递增的比例
    fn continuity_score(&self) -> Option<f64> {
        if !self.opened_by_reset || self.numbered_pages.len() < 2 {
            return None;
        }
        let pairs = self.numbered_pages.len() - 1;
        let continuous = self
            .numbered_pages
            .windows(2)
            .filter(|w| follows(w[0].1, w[1].0))
            .count();
        Some(continuous as f64 / pairs as f64)
    }

    fn method(&self) -> DetectionMethod {
        match (self.started_by_identity, self.started_by_cycle) {
            (true, true) => DetectionMethod::Hybrid,
            (true, false) => DetectionMethod::Identity,
            _ => DetectionMethod::Cycle,
        }
    }
}

/// 边界识别器
#[derive(Debug, Clone, Default)]
pub struct BoundaryDetector {
    settings: DetectorSettings,
}

impl BoundaryDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// 识别学生边界
    ///
    /// 对任何输入（包括空输入、单页输入）都返回结果，不会失败
    pub fn detect(&self, input: &DetectionInput) -> BoundaryDetectionResult {
        let pages = input.normalized_pages();
        if pages.is_empty() {
            debug!("没有页面，返回空的识别结果");
            return BoundaryDetectionResult::empty();
        }

        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;
        let mut pending_blank: Vec<usize> = Vec::new();
        let mut unassigned: Vec<usize> = Vec::new();

        for (pos, page) in pages.iter().enumerate() {
            let numbers = self.effective_numbers(page);
            let qualified = self.qualified_identity(page);

            if numbers.is_empty() && page.identity.is_none() {
                // 无任何信号：暂存，等下一页决定它属于分组内部还是分组之间
                match current {
                    Some(_) => pending_blank.push(page.page_index),
                    None => unassigned.push(page.page_index),
                }
                continue;
            }

            let previous = pos.checked_sub(1).map(|i| &pages[i]);

            let Some(group) = current.as_mut() else {
                current = Some(self.open_first_group(page, &numbers, qualified));
                continue;
            };

            let identity_change = match (qualified, group.identity.as_ref()) {
                (Some(candidate), Some(known)) => candidate.normalized_key() != known.normalized_key(),
                _ => false,
            };
            let cycle_reset = match (numbers.first(), group.max_seen) {
                (Some(&lead), Some(max_seen)) => lead <= max_seen,
                _ => false,
            };

            if identity_change || cycle_reset {
                unassigned.append(&mut pending_blank);
                if let Some(done) = current.take() {
                    groups.push(done);
                }
                current = Some(self.open_group(
                    page,
                    previous,
                    &numbers,
                    qualified,
                    identity_change,
                    cycle_reset,
                ));
            } else {
                group.end_page = page.page_index;
                pending_blank.clear();
                group.push_numbers(&numbers);
                if group.identity.is_none() {
                    group.identity = qualified.cloned();
                }
            }
        }

        unassigned.append(&mut pending_blank);
        if let Some(done) = current.take() {
            groups.push(done);
        }
        unassigned.sort_unstable();

        let boundaries = self.finalize(groups);
        let result = BoundaryDetectionResult {
            total_students: boundaries.len(),
            boundaries,
            unassigned_pages: unassigned,
            total_pages: pages.len(),
            timestamp: Utc::now(),
        };

        info!(
            "边界识别完成: {} 页 → {} 名学生，{} 页未分配，{} 个边界需要确认",
            result.total_pages,
            result.total_students,
            result.unassigned_pages.len(),
            result.needing_confirmation().count()
        );

        result
    }

    fn effective_numbers(&self, page: &PageSignal) -> Vec<u32> {
        if !page.question_numbers.is_empty() {
            return page.question_numbers.clone();
        }
        page.text
            .as_deref()
            .map(extract_question_numbers)
            .unwrap_or_default()
    }

    fn qualified_identity<'a>(&self, page: &'a PageSignal) -> Option<&'a IdentityCandidate> {
        page.identity
            .as_ref()
            .filter(|c| c.confidence >= self.settings.identity_floor)
    }

    fn open_first_group(
        &self,
        page: &PageSignal,
        numbers: &[u32],
        qualified: Option<&IdentityCandidate>,
    ) -> Group {
        let mut group = Group {
            start_page: page.page_index,
            end_page: page.page_index,
            numbered_pages: Vec::new(),
            max_seen: None,
            identity: qualified.cloned(),
            started_by_identity: qualified.is_some(),
            started_by_cycle: !numbers.is_empty(),
            opened_by_reset: false,
            identity_score: qualified.map(|c| c.confidence),
            sharpness: if qualified.is_some() {
                self.settings.sharpness_identity_change
            } else {
                self.settings.sharpness_default
            },
        };
        group.push_numbers(numbers);
        group
    }

    fn open_group(
        &self,
        page: &PageSignal,
        previous: Option<&PageSignal>,
        numbers: &[u32],
        qualified: Option<&IdentityCandidate>,
        identity_change: bool,
        cycle_reset: bool,
    ) -> Group {
        let sharpness = if identity_change {
            self.settings.sharpness_identity_change
        } else if self.previous_has_distinct_identity(previous, qualified) {
            self.settings.sharpness_previous_identity
        } else {
            self.settings.sharpness_default
        };

        let mut group = Group {
            start_page: page.page_index,
            end_page: page.page_index,
            numbered_pages: Vec::new(),
            max_seen: None,
            identity: qualified.cloned(),
            started_by_identity: identity_change,
            started_by_cycle: cycle_reset,
            opened_by_reset: cycle_reset,
            identity_score: if identity_change {
                qualified.map(|c| c.confidence)
            } else {
                None
            },
            sharpness,
        };
        group.push_numbers(numbers);
        group
    }

    fn previous_has_distinct_identity(
        &self,
        previous: Option<&PageSignal>,
        current: Option<&IdentityCandidate>,
    ) -> bool {
        let Some(prev) = previous.and_then(|p| self.qualified_identity(p)) else {
            return false;
        };
        match current {
            Some(cur) => cur.normalized_key() != prev.normalized_key(),
            None => true,
        }
    }

    fn finalize(&self, groups: Vec<Group>) -> Vec<StudentBoundary> {
        let mut used_keys: HashSet<String> = HashSet::new();

        groups
            .into_iter()
            .enumerate()
            .map(|(idx, group)| {
                let base_key = group
                    .identity
                    .as_ref()
                    .map(IdentityCandidate::normalized_key)
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| format!("student-{:03}", idx + 1));
                let student_key = unique_key(&mut used_keys, base_key);

                let confidence = self.combine(
                    group.identity_score,
                    group.continuity_score(),
                    group.sharpness,
                );

                StudentBoundary {
                    student_key,
                    start_page: group.start_page,
                    end_page: group.end_page,
                    confidence,
                    needs_confirmation: confidence < self.settings.confidence_threshold,
                    detection_method: group.method(),
                }
            })
            .collect()
    }

    /// 加权平均可用分量，结果截断到 [0, 1] 并保留 4 位小数
    fn combine(&self, identity: Option<f64>, continuity: Option<f64>, sharpness: f64) -> f64 {
        let w = self.settings.weights;
        let parts = [
            identity.map(|s| (s, w.identity)),
            continuity.map(|s| (s, w.continuity)),
            Some((sharpness, w.sharpness)),
        ];

        let (sum, weight) = parts
            .iter()
            .flatten()
            .filter(|(_, weight)| *weight > 0.0)
            .fold((0.0, 0.0), |(sum, total), (score, weight)| {
                (sum + score * weight, total + weight)
            });

        let mean = if weight > 0.0 { sum / weight } else { sharpness };
        (mean.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
    }
}

fn unique_key(used: &mut HashSet<String>, base: String) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}#{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

impl Stage for BoundaryDetector {
    const COMPONENT: Component = Component::BoundaryDetector;
    type Input = DetectionInput;
    type Output = BoundaryDetectionResult;
    type Error = Infallible;

    fn run(&self, input: &DetectionInput) -> Result<BoundaryDetectionResult, Infallible> {
        Ok(self.detect(input))
    }
}
