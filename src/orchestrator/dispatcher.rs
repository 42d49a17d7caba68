//! 评分派发器 - 编排层
//!
//! ## 职责
//!
//! 把批次和压缩评分细则包变成一组有并发上限的评分任务。
//!
//! ## 核心功能
//!
//! 1. **批次并发**：按 `parallel_priority` 依次启动批次，最多 `max_parallel_batches` 个同时运行
//! 2. **批内并发**：每个批次最多 `workers_per_batch` 个学生同时评分
//! 3. **故障隔离**：单个学生失败只影响自己
//! 4. **复核分流**：低置信度结果写入复核队列
//! 5. **取消**：每个批次一个取消标记，按 `CancelPolicy` 处理在途任务
//!
//! 结果按 `student_key` 汇总，与完成顺序无关。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use crate::cache::CacheManager;
use crate::config::{CancelPolicy, Config};
use crate::error::{CacheError, Component, ErrorKind, ErrorLog};
use crate::models::{
    Batch, CompressedRubricPackage, GradingJob, JobStatus, ReviewItem, ReviewSource,
};
use crate::services::ReviewQueue;
use crate::workflow::{BatchContext, GradingFlow, JobCtx};

/// 派发参数
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub max_parallel_batches: usize,
    pub workers_per_batch: usize,
    /// 低于该置信度的结果进入复核队列
    pub review_confidence_threshold: f64,
    pub cancel_policy: CancelPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_parallel_batches: 3,
            workers_per_batch: 4,
            review_confidence_threshold: 0.7,
            cancel_policy: CancelPolicy::Drain,
        }
    }
}

impl From<&Config> for DispatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_parallel_batches: config.max_parallel_batches,
            workers_per_batch: config.workers_per_batch,
            review_confidence_threshold: config.review_confidence_threshold,
            cancel_policy: config.cancel_policy,
        }
    }
}

/// 派发输入
#[derive(Debug, Clone)]
pub struct DispatchInput {
    pub submission_id: String,
    pub batches: Vec<Batch>,
    /// 编译好的评分细则包（`batch_id` 为空）
    pub package: CompressedRubricPackage,
    /// student_key → 作答内容
    pub contents: HashMap<String, String>,
}

/// 单个批次的运行状态，计数器只用原子量
#[derive(Debug, Default)]
pub struct BatchControl {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicBool,
    notify: Notify,
}

impl BatchControl {
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn cancelled(&self) {
        loop {
            // 先注册再检查标记，避免错过通知
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 批次汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
}

/// 派发结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub submission_id: String,
    pub jobs: BTreeMap<String, GradingJob>,
    pub batches: Vec<BatchSummary>,
    pub review_items: usize,
}

impl DispatchReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|job| job.status == status).count()
    }
}

pub struct GradingDispatcher {
    settings: DispatchSettings,
    flow: Arc<GradingFlow>,
    cache: Arc<CacheManager>,
    review: Arc<ReviewQueue>,
    errors: Arc<ErrorLog>,
    controls: Mutex<HashMap<String, Arc<BatchControl>>>,
}

impl GradingDispatcher {
    pub fn new(
        settings: DispatchSettings,
        flow: GradingFlow,
        cache: Arc<CacheManager>,
        review: Arc<ReviewQueue>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            settings,
            flow: Arc::new(flow),
            cache,
            review,
            errors,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// 取消某个批次；批次尚未开始时，开始后立即停止派发
    pub fn cancel(&self, batch_id: &str) {
        info!("🛑 取消批次 {}（策略: {:?}）", batch_id, self.settings.cancel_policy);
        self.control(batch_id).cancel();
    }

    /// 批次进度；派发结束后控制信息随之释放，最终结果见 `DispatchReport::batches`
    pub fn progress(&self, batch_id: &str) -> Option<BatchSummary> {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        controls.get(batch_id).map(|control| summarize(batch_id, control))
    }

    fn control(&self, batch_id: &str) -> Arc<BatchControl> {
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(controls.entry(batch_id.to_string()).or_default())
    }

    /// 派发所有批次，等待全部结束
    pub async fn dispatch(self: &Arc<Self>, input: DispatchInput) -> DispatchReport {
        let DispatchInput {
            submission_id,
            mut batches,
            package,
            contents,
        } = input;

        batches.sort_by_key(|b| b.parallel_priority);

        // 先把所有任务登记为 queued，未被派发的任务保持这个状态
        let mut report = DispatchReport {
            submission_id: submission_id.clone(),
            ..DispatchReport::default()
        };
        for batch in &batches {
            for student in &batch.students {
                report.jobs.insert(
                    student.student_key.clone(),
                    GradingJob::new(&batch.batch_id, &student.student_key),
                );
            }
        }
        let review_before = self.review.len();

        let batch_semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_batches.max(1)));
        let package = Arc::new(package);
        let contents = Arc::new(contents);
        let mut handles = Vec::new();

        for batch in &batches {
            let Ok(permit) = batch_semaphore.clone().acquire_owned().await else {
                break;
            };

            let dispatcher = Arc::clone(self);
            let batch_clone = batch.clone();
            let package = Arc::clone(&package);
            let contents = Arc::clone(&contents);
            let submission_id = submission_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                dispatcher
                    .run_batch(&submission_id, batch_clone, &package, contents)
                    .await
            });
            handles.push((batch.batch_id.clone(), handle));
        }

        // 等待所有批次结束
        let (batch_ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (batch_id, joined) in batch_ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(jobs) => {
                    for job in jobs {
                        report.jobs.insert(job.student_key.clone(), job);
                    }
                }
                Err(e) => {
                    error!("[批次 {}] 任务执行失败: {}", batch_id, e);
                    self.errors.record(
                        Component::GradingDispatcher,
                        ErrorKind::JobFailed,
                        format!("批次 {} 异常退出: {}", batch_id, e),
                    );
                }
            }
        }

        {
            let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
            for batch in &batches {
                controls.remove(&batch.batch_id);
            }
        }

        report.batches = batches
            .iter()
            .map(|batch| {
                let jobs = report.jobs.values().filter(|j| j.batch_id == batch.batch_id);
                let mut summary = BatchSummary {
                    batch_id: batch.batch_id.clone(),
                    total: batch.len(),
                    completed: 0,
                    failed: 0,
                    queued: 0,
                };
                for job in jobs {
                    match job.status {
                        JobStatus::Completed => summary.completed += 1,
                        JobStatus::Failed => summary.failed += 1,
                        JobStatus::Queued | JobStatus::Running => summary.queued += 1,
                    }
                }
                summary
            })
            .collect();
        report.review_items = self.review.len().saturating_sub(review_before);

        info!(
            "📊 提交 {} 派发完成: 完成 {}，失败 {}，未派发 {}，待复核 {}",
            submission_id,
            report.count(JobStatus::Completed),
            report.count(JobStatus::Failed),
            report.count(JobStatus::Queued),
            report.review_items
        );
        report
    }

    async fn run_batch(
        self: Arc<Self>,
        submission_id: &str,
        batch: Batch,
        package: &CompressedRubricPackage,
        contents: Arc<HashMap<String, String>>,
    ) -> Vec<GradingJob> {
        let control = self.control(&batch.batch_id);
        control.total.store(batch.len(), Ordering::SeqCst);
        control.completed.store(0, Ordering::SeqCst);
        control.failed.store(0, Ordering::SeqCst);

        info!("\n{}", "=".repeat(60));
        info!(
            "📦 开始批次 {}（{} 名学生，预估成本 {:.1}）",
            batch.batch_id,
            batch.len(),
            batch.estimated_cost
        );
        info!("{}", "=".repeat(60));

        let batch_ctx = Arc::new(self.batch_context(&batch.batch_id, package).await);
        let workers = Arc::new(Semaphore::new(self.settings.workers_per_batch.max(1)));
        let mut handles = Vec::new();
        let mut scheduled = 0;

        for (idx, student) in batch.students.iter().enumerate() {
            if control.is_cancelled() {
                break;
            }
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            if control.is_cancelled() {
                break;
            }

            let mut job = GradingJob::new(&batch.batch_id, &student.student_key);
            job.transition(JobStatus::Running);

            let ctx = JobCtx::new(submission_id, &batch.batch_id, &student.student_key, idx + 1);
            let dispatcher = Arc::clone(&self);
            let control = Arc::clone(&control);
            let batch_ctx = Arc::clone(&batch_ctx);
            let contents = Arc::clone(&contents);

            let handle = tokio::spawn(async move {
                let _permit = permit;
                dispatcher.run_job(job, ctx, &batch_ctx, &contents, &control).await
            });
            handles.push((student.student_key.clone(), handle));
            scheduled += 1;
        }

        if scheduled < batch.len() {
            warn!(
                "[批次 {}] 已取消，{} 名学生未派发",
                batch.batch_id,
                batch.len() - scheduled
            );
        }

        let mut jobs: Vec<GradingJob> = batch
            .students
            .iter()
            .skip(scheduled)
            .map(|s| GradingJob::new(&batch.batch_id, &s.student_key))
            .collect();

        for (student_key, handle) in handles {
            match handle.await {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    error!("[批次 {}] 学生 {} 任务异常: {}", batch.batch_id, student_key, e);
                    let mut job = GradingJob::new(&batch.batch_id, &student_key);
                    job.transition(JobStatus::Running);
                    job.fail(format!("task panicked: {}", e));
                    control.failed.fetch_add(1, Ordering::SeqCst);
                    self.errors.record(
                        Component::GradingDispatcher,
                        ErrorKind::JobFailed,
                        format!("{} {}: {}", batch.batch_id, student_key, e),
                    );
                    jobs.push(job);
                }
            }
        }

        info!("\n{}", "─".repeat(60));
        info!(
            "✓ 批次 {} 完成: 成功 {}/{}，失败 {}",
            batch.batch_id,
            control.completed(),
            control.total(),
            control.failed()
        );
        info!("{}", "─".repeat(60));

        jobs
    }

    /// 每个批次取一次评分细则包，并尝试挂上服务端上下文缓存
    async fn batch_context(&self, batch_id: &str, package: &CompressedRubricPackage) -> BatchContext {
        let key = format!("rubric:{}", package.rubric_hash);
        let fetched = self
            .cache
            .get_or_compute_json::<CompressedRubricPackage, _, _, CacheError>(&key, || async {
                Ok(package.clone())
            })
            .await;

        let package = match fetched {
            Ok(cached) => cached.for_batch(batch_id),
            Err(e) => {
                warn!("[批次 {}] 读取评分细则包失败，使用内存中的副本: {}", batch_id, e);
                package.for_batch(batch_id)
            }
        };

        let rubric_text = package.render_prompt_context();
        let handle = self.cache.context_handle_for(&key, &rubric_text).await;

        BatchContext {
            package,
            rubric_text,
            handle,
        }
    }

    async fn run_job(
        &self,
        mut job: GradingJob,
        ctx: JobCtx,
        batch_ctx: &BatchContext,
        contents: &HashMap<String, String>,
        control: &BatchControl,
    ) -> GradingJob {
        let content = contents.get(&ctx.student_key).map(String::as_str).unwrap_or_default();
        if content.is_empty() {
            warn!("{} 作答内容为空", ctx);
        }

        let result = match self.settings.cancel_policy {
            CancelPolicy::Abort => {
                tokio::select! {
                    result = self.flow.run(&ctx, batch_ctx, content) => Some(result),
                    _ = control.cancelled() => None,
                }
            }
            CancelPolicy::Drain => Some(self.flow.run(&ctx, batch_ctx, content).await),
        };

        match result {
            Some(Ok(success)) => {
                job.attempts = success.attempts;
                let confidence = success.outcome.confidence;
                job.complete(success.outcome);
                control.completed.fetch_add(1, Ordering::SeqCst);

                if confidence < self.settings.review_confidence_threshold {
                    let item = ReviewItem::new(
                        ReviewSource::Job,
                        &ctx.submission_id,
                        &ctx.student_key,
                        confidence,
                        format!(
                            "评分置信度 {:.2} 低于阈值 {:.2}",
                            confidence, self.settings.review_confidence_threshold
                        ),
                    );
                    if let Err(e) = self.review.push(item).await {
                        warn!("{} 写入复核队列失败: {}", ctx, e);
                    }
                }
            }
            Some(Err(failure)) => {
                job.attempts = failure.attempts;
                job.fail(failure.error.to_string());
                control.failed.fetch_add(1, Ordering::SeqCst);
                self.errors.record(
                    Component::GradingDispatcher,
                    ErrorKind::JobFailed,
                    format!("{} {}", ctx, failure.error),
                );
            }
            None => {
                warn!("{} 已中断（批次取消）", ctx);
                job.fail("cancelled");
                control.failed.fetch_add(1, Ordering::SeqCst);
                self.errors.record(
                    Component::GradingDispatcher,
                    ErrorKind::JobFailed,
                    format!("{} cancelled", ctx),
                );
            }
        }
        job
    }
}

fn summarize(batch_id: &str, control: &BatchControl) -> BatchSummary {
    let total = control.total();
    let completed = control.completed();
    let failed = control.failed();
    BatchSummary {
        batch_id: batch_id.to_string(),
        total,
        completed,
        failed,
        queued: total.saturating_sub(completed + failed),
    }
}
