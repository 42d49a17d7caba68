//! # Batch Grading
//!
//! 多学生扫描提交的批量评分流水线
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 外部资源的抽象，只暴露能力
//! - `InferenceProvider` - 生成与服务端上下文缓存
//! - `SharedKvStore` / `DurableStore` - 共享缓存与历史结果
//!
//! ### ② 业务能力层（Services / Cache）
//! - `services/` - 描述"我能做什么"
//! - `BoundaryDetector` - 识别每个学生的页范围
//! - `BatchPlanner` - 把学生切分成批次
//! - `RubricCompiler` - 压缩评分细则
//! - `LlmService` - 推理服务实现
//! - `ReviewQueue` - 复核队列
//! - `cache/` - 本地 / 共享 / 服务端三层缓存
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个学生"的完整评分流程
//! - `JobCtx` - 上下文封装（batch_id + student_key）
//! - `GradingFlow` - 流程编排（缓存 → 推理 → 重试 → 解析）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/pipeline` - 应用流水线，管理资源和统计
//! - `orchestrator/dispatcher` - 评分派发，管理批次并发和取消
//!
//! ## 模块结构

pub mod cache;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use cache::{CacheManager, CacheSettings, CacheStats};
pub use config::{CancelPolicy, Config};
pub use error::{AppError, AppResult, ErrorKind, ErrorLog};
pub use models::{Batch, BoundaryDetectionResult, Submission};
pub use orchestrator::{App, GradingDispatcher, RunStats};
pub use workflow::{GradingFlow, JobCtx};
