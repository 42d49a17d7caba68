//! 批量评分应用 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责资源的创建和整条流水线的调度。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、推理服务、三层缓存、复核队列
//! 2. **缓存预热**：后台任务，不阻塞启动
//! 3. **逐份处理提交**：边界识别 → 分批 → 评分细则压缩 → 派发
//! 4. **结果输出**：每份提交一个 JSON 结果文件，最后输出全局统计
//!
//! 只有分批参数无效和评分细则无效会让一份提交失败，其余错误都只降级。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::{CacheManager, CacheSettings, CacheStats};
use crate::config::Config;
use crate::error::{AppResult, Component, ErrorKind, ErrorLog};
use crate::infrastructure::{
    DurableStore, HttpKvStore, InMemoryKvStore, InferenceProvider, JsonlDurableStore,
    SharedKvStore,
};
use crate::models::{Batch, BoundaryDetectionResult, JobStatus, Submission};
use crate::orchestrator::dispatcher::{
    DispatchInput, DispatchReport, DispatchSettings, GradingDispatcher,
};
use crate::services::{
    run_stage, BatchPlanner, BoundaryDetector, DetectionInput, LlmService, PlanningInput,
    ReviewQueue, RubricCompiler,
};
use crate::utils::logging;
use crate::workflow::GradingFlow;

/// 一份提交的处理结果
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReport {
    pub submission_id: String,
    pub detection: BoundaryDetectionResult,
    pub batches: Vec<Batch>,
    pub rubric_hash: String,
    pub dispatch: DispatchReport,
}

/// 全局统计
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub submissions: usize,
    pub failed_submissions: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
    pub review_items: usize,
    pub cache: CacheStats,
}

/// 应用主结构
pub struct App {
    config: Config,
    errors: Arc<ErrorLog>,
    cache: Arc<CacheManager>,
    review: Arc<ReviewQueue>,
    dispatcher: Arc<GradingDispatcher>,
    detector: BoundaryDetector,
    planner: BatchPlanner,
    compiler: RubricCompiler,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        logging::init_log_file(&config.output_log_file)?;

        logging::log_startup(
            config.max_parallel_batches,
            config.workers_per_batch,
            &config.llm_model_name,
        );

        let provider: Arc<dyn InferenceProvider> =
            Arc::new(LlmService::new(&config).context("创建推理服务失败")?);

        let shared: Arc<dyn SharedKvStore> = match &config.shared_cache_url {
            Some(url) => {
                info!("🔗 共享缓存: {}", url);
                Arc::new(
                    HttpKvStore::new(url.as_str(), Duration::from_secs(5))
                        .context("创建共享缓存客户端失败")?,
                )
            }
            None => Arc::new(InMemoryKvStore::new()),
        };

        let durable: Option<Arc<dyn DurableStore>> = config
            .durable_store_path
            .as_ref()
            .map(|path| Arc::new(JsonlDurableStore::new(path)) as Arc<dyn DurableStore>);

        let review = Arc::new(ReviewQueue::with_path(config.review_file.clone()));

        Ok(Self::with_components(config, provider, shared, durable, review))
    }

    /// 用给定的外部组件组装应用
    pub fn with_components(
        config: Config,
        provider: Arc<dyn InferenceProvider>,
        shared: Arc<dyn SharedKvStore>,
        durable: Option<Arc<dyn DurableStore>>,
        review: Arc<ReviewQueue>,
    ) -> Self {
        let errors = Arc::new(ErrorLog::new());

        let mut cache = CacheManager::new(CacheSettings::from(&config), Arc::clone(&errors))
            .with_shared(shared)
            .with_provider(Arc::clone(&provider));
        if let Some(durable) = durable {
            cache = cache.with_durable_store(durable);
        }
        let cache = Arc::new(cache);

        let flow = GradingFlow::new(&config, provider, Arc::clone(&cache), Arc::clone(&errors));
        let dispatcher = Arc::new(GradingDispatcher::new(
            DispatchSettings::from(&config),
            flow,
            Arc::clone(&cache),
            Arc::clone(&review),
            Arc::clone(&errors),
        ));

        Self {
            detector: BoundaryDetector::new((&config).into()),
            planner: BatchPlanner::new((&config).into()),
            compiler: RubricCompiler::new((&config).into()),
            config,
            errors,
            cache,
            review,
            dispatcher,
        }
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn review(&self) -> &ReviewQueue {
        &self.review
    }

    pub fn dispatcher(&self) -> &Arc<GradingDispatcher> {
        &self.dispatcher
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<RunStats> {
        // 预热在后台进行
        let warmup = self.cache.warmup();

        let submissions = self.load_submissions().await?;
        if submissions.is_empty() {
            warn!("⚠️ 没有找到待处理的提交文件，程序结束");
            return Ok(RunStats::default());
        }
        logging::log_submissions_loaded(submissions.len());

        tokio::fs::create_dir_all(&self.config.results_folder)
            .await
            .with_context(|| format!("无法创建结果目录: {}", self.config.results_folder))?;

        let mut stats = RunStats {
            submissions: submissions.len(),
            ..RunStats::default()
        };

        for (index, submission) in submissions.iter().enumerate() {
            logging::log_submission_start(
                index + 1,
                submissions.len(),
                &submission.submission_id,
                submission.pages.len(),
            );

            match self.process_submission(submission).await {
                Ok(report) => {
                    stats.completed += report.dispatch.count(JobStatus::Completed);
                    stats.failed += report.dispatch.count(JobStatus::Failed);
                    stats.queued += report.dispatch.count(JobStatus::Queued);
                    self.write_report(&report).await?;
                }
                Err(e) => {
                    error!("[提交 {}] ❌ 处理失败: {}", submission.submission_id, e);
                    stats.failed_submissions += 1;
                    logging::append_log_line(
                        &self.config.output_log_file,
                        &format!("{} | 失败 | {}", submission.submission_id, e),
                    )?;
                }
            }
        }

        match warmup.await {
            Ok(report) => info!("🔥 预热结果: 写入 {}，跳过 {}", report.loaded, report.skipped),
            Err(e) => warn!("缓存预热任务异常: {}", e),
        }

        stats.review_items = self.review.len();
        stats.cache = self.cache.stats();

        logging::print_final_stats(
            stats.submissions,
            stats.failed_submissions,
            stats.completed,
            stats.failed,
            stats.queued,
            stats.review_items,
            &self.config.output_log_file,
        );
        Ok(stats)
    }

    /// 处理一份提交：边界识别 → 分批 → 评分细则压缩 → 派发
    pub async fn process_submission(&self, submission: &Submission) -> AppResult<SubmissionReport> {
        let detection = match run_stage(
            &self.detector,
            &DetectionInput::new(submission.pages.clone()),
            ErrorKind::DetectionAmbiguous,
            &self.errors,
        ) {
            Ok(detection) => detection,
            Err(never) => match never {},
        };

        for boundary in detection.needing_confirmation() {
            self.errors.record(
                Component::BoundaryDetector,
                ErrorKind::DetectionAmbiguous,
                format!(
                    "{} {} 置信度 {:.2}",
                    submission.submission_id, boundary.student_key, boundary.confidence
                ),
            );
        }
        self.review
            .push_boundaries(&submission.submission_id, &detection)
            .await;

        let students = detection.student_refs(self.config.tokens_per_page);
        let batches = run_stage(
            &self.planner,
            &PlanningInput::new(&submission.submission_id, students.clone()),
            ErrorKind::PlanningInvalid,
            &self.errors,
        )?;

        let package = self
            .compiler
            .compile_cached(&submission.rubric, &self.cache)
            .await
            .inspect_err(|e| {
                if let Some(kind) = e.kind() {
                    self.errors.record(
                        Component::RubricCompiler,
                        kind,
                        format!("{}: {}", submission.submission_id, e),
                    );
                }
            })?;

        let contents: HashMap<String, String> = students
            .iter()
            .map(|student| (student.student_key.clone(), submission.content_for(student)))
            .collect();

        let rubric_hash = package.rubric_hash.clone();
        let dispatch = self
            .dispatcher
            .dispatch(DispatchInput {
                submission_id: submission.submission_id.clone(),
                batches: batches.clone(),
                package,
                contents,
            })
            .await;

        Ok(SubmissionReport {
            submission_id: submission.submission_id.clone(),
            detection,
            batches,
            rubric_hash,
            dispatch,
        })
    }

    /// 加载提交
    async fn load_submissions(&self) -> Result<Vec<Submission>> {
        info!("\n📁 正在扫描待处理的提交...");
        crate::models::load_all_submissions(&self.config.submission_folder).await
    }

    async fn write_report(&self, report: &SubmissionReport) -> Result<()> {
        let path = Path::new(&self.config.results_folder)
            .join(format!("{}.json", report.submission_id));
        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("写入结果失败: {}", path.display()))?;

        logging::append_log_line(
            &self.config.output_log_file,
            &format!(
                "{} | 学生 {} | 完成 {} | 失败 {} | 未派发 {} | 未分配页 {:?}",
                report.submission_id,
                report.detection.total_students,
                report.dispatch.count(JobStatus::Completed),
                report.dispatch.count(JobStatus::Failed),
                report.dispatch.count(JobStatus::Queued),
                report.detection.unassigned_pages
            ),
        )?;
        info!("💾 结果已保存: {}", path.display());
        Ok(())
    }
}
