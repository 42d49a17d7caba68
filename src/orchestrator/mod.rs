//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `pipeline` - 应用流水线
//! - 管理应用生命周期（初始化、预热、运行、统计）
//! - 逐份处理提交：边界识别 → 分批 → 评分细则压缩 → 派发
//! - 输出结果文件和全局统计信息
//!
//! ### `dispatcher` - 评分派发器
//! - 控制批次并行数和批内并发数（Semaphore）
//! - 维护每个学生任务的状态（queued → running → completed / failed）
//! - 处理批次取消（drain / abort）
//! - 低置信度结果送入复核队列
//!
//! ## 层次关系
//!
//! ```text
//! pipeline (处理 Vec<Submission>)
//!     ↓
//! dispatcher (处理 Vec<Batch>)
//!     ↓
//! workflow::GradingFlow (处理单个学生)
//!     ↓
//! services / cache (能力层)
//!     ↓
//! infrastructure (推理服务、共享缓存、历史结果)
//! ```

pub mod dispatcher;
pub mod pipeline;

// 重新导出主要类型
pub use dispatcher::{
    BatchControl, BatchSummary, DispatchInput, DispatchReport, DispatchSettings,
    GradingDispatcher,
};
pub use pipeline::{App, RunStats, SubmissionReport};
