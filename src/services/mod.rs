//! 业务能力层（Services）
//!
//! 每个服务只提供一种能力，不关心流程顺序。
//! 流水线的纯计算阶段实现 [`Stage`]，通过泛型静态分发调用。

pub mod batch_planner;
pub mod boundary_detector;
pub mod llm_service;
pub mod review_queue;
pub mod rubric_compiler;

use crate::error::{Component, ErrorKind, ErrorLog};

pub use batch_planner::{BatchPlanner, PlannerSettings, PlanningInput};
pub use boundary_detector::{
    extract_question_numbers, BoundaryDetector, ConfidenceWeights, DetectionInput,
    DetectorSettings,
};
pub use llm_service::LlmService;
pub use review_queue::ReviewQueue;
pub use rubric_compiler::{CompilerSettings, RubricCompiler};

/// 流水线阶段
///
/// 输入输出都是显式的类型化记录，阶段只能读写自己声明的字段。
pub trait Stage {
    const COMPONENT: Component;
    type Input;
    type Output;
    type Error: std::error::Error;

    fn run(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 运行一个阶段，失败时以该阶段的标签记入运行级错误列表
pub fn run_stage<S: Stage>(
    stage: &S,
    input: &S::Input,
    kind: ErrorKind,
    errors: &ErrorLog,
) -> Result<S::Output, S::Error> {
    stage.run(input).inspect_err(|e| {
        errors.record(S::COMPONENT, kind, e.to_string());
    })
}
