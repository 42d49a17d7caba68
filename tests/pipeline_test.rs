use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_grading::config::{CancelPolicy, Config};
use batch_grading::error::{AppError, ErrorKind, PlanningError, ProviderError};
use batch_grading::infrastructure::{
    ContextHandle, GenerationRequest, InMemoryDurableStore, InMemoryKvStore, InferenceProvider,
    SharedKvStore,
};
use batch_grading::logger;
use batch_grading::models::{
    IdentityCandidate, JobStatus, PageSignal, Points, ReviewSource, RubricCriterion,
    RubricUnderstanding, Submission,
};
use batch_grading::services::{ReviewQueue, RubricCompiler};
use batch_grading::workflow::grade_cache_key;
use batch_grading::App;
use chrono::Utc;
use tokio::sync::{mpsc, Notify};

/// 按作答内容中的标记决定返回什么的推理服务
///
/// - `SLOW`: 通知测试已开始，然后等待放行
/// - `GARBAGE`: 返回无法解析的文本
/// - `FLAKY`: 前两次返回临时故障
/// - `UNSURE`: 低置信度
/// - `HOLD`: 占用 100ms，用来观察并发数
/// - `HANG`: 一直不返回，直到调用超时
struct ScriptedProvider {
    calls: AtomicUsize,
    flaky_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    release: Notify,
    started: mpsc::UnboundedSender<()>,
}

impl ScriptedProvider {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            calls: AtomicUsize::new(0),
            flaky_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            release: Notify::new(),
            started: tx,
        });
        (provider, rx)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 同时进行中的 generate 调用数的最大值
    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// 离开作用域时把进行中的调用数减一（超时被丢弃时也一样）
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

const CONFIDENT: &str =
    r#"{"score": 8, "confidence": 0.95, "criteria": [{"id": "c1", "awarded": 5}, {"id": "c2", "awarded": 3}], "feedback": "good"}"#;

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn min_cacheable_tokens(&self) -> usize {
        0
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        let prompt = request.prompt.as_str();

        if prompt.contains("HOLD") {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if prompt.contains("HANG") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }

        if prompt.contains("SLOW") {
            let _ = self.started.send(());
            self.release.notified().await;
        }
        if prompt.contains("GARBAGE") {
            return Ok("I cannot grade this".to_string());
        }
        if prompt.contains("FLAKY") && self.flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(ProviderError::Transient {
                provider: "scripted".to_string(),
                message: "503".to_string(),
            });
        }
        if prompt.contains("UNSURE") {
            return Ok(r#"```json
{"score": 4, "confidence": 0.3, "criteria": [{"id": "c1", "awarded": 4}], "feedback": "unclear"}
```"#
                .to_string());
        }
        Ok(CONFIDENT.to_string())
    }

    async fn create_context_cache(
        &self,
        _content: &str,
        _ttl: Duration,
    ) -> Result<ContextHandle, ProviderError> {
        Ok(ContextHandle {
            name: "cachedContents/scripted".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            token_count: 0,
        })
    }

    async fn get_context_cache(&self, _name: &str) -> Result<Option<ContextHandle>, ProviderError> {
        Ok(None)
    }

    async fn delete_context_cache(&self, _name: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn test_config() -> Config {
    Config {
        max_batch_size: 2,
        max_parallel_batches: 2,
        workers_per_batch: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        provider_timeout_secs: 5,
        ..Config::default()
    }
}

fn rubric() -> RubricUnderstanding {
    let criterion = |id: &str, description: &str, points: f64| RubricCriterion {
        id: id.to_string(),
        description: description.to_string(),
        points: Points::try_from(points).unwrap(),
        keywords: vec!["derivative".to_string()],
        required_elements: vec!["final answer".to_string()],
    };
    RubricUnderstanding::new(vec![
        criterion("c1", "Correct derivative of the polynomial", 6.0),
        criterion("c2", "States the final answer with units", 4.0),
    ])
}

/// 每个学生两页，第一页写姓名，作答文本带上标记
fn submission(id: &str, students: &[(&str, &str)]) -> Submission {
    let mut pages = Vec::new();
    for (name, marker) in students {
        let identity = IdentityCandidate::new(*name, 0.95);
        let first = pages.len();
        pages.push(
            PageSignal::new(first)
                .with_questions([1])
                .with_identity(identity.clone())
                .with_text(format!("{} answer one {}", name, marker)),
        );
        pages.push(
            PageSignal::new(first + 1)
                .with_questions([2])
                .with_identity(identity)
                .with_text(format!("{} answer two", name)),
        );
    }
    Submission {
        submission_id: id.to_string(),
        name: format!("{} exam", id),
        pages,
        rubric: rubric(),
        file_path: None,
    }
}

fn app_with(config: Config, provider: Arc<ScriptedProvider>) -> App {
    logger::init();
    App::with_components(
        config,
        provider,
        Arc::new(InMemoryKvStore::new()),
        None,
        Arc::new(ReviewQueue::in_memory()),
    )
}

#[tokio::test]
async fn test_full_pipeline_grades_every_student() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), Arc::clone(&provider));
    let sub = submission(
        "exam-1",
        &[("alice", ""), ("bob", ""), ("carol", ""), ("dave", ""), ("erin", "")],
    );

    let report = app.process_submission(&sub).await.unwrap();

    assert_eq!(report.detection.total_students, 5);
    assert!(report.detection.unassigned_pages.is_empty());
    // 5 名学生，单批上限 2 → 3 个批次
    assert_eq!(report.batches.len(), 3);
    assert_eq!(report.dispatch.jobs.len(), 5);
    assert_eq!(report.dispatch.count(JobStatus::Completed), 5);

    let alice = &report.dispatch.jobs["alice"];
    let outcome = alice.result.as_ref().unwrap();
    assert_eq!(outcome.score, Points::try_from(8.0).unwrap());
    assert_eq!(outcome.max_score, Points::try_from(10.0).unwrap());
    assert_eq!(alice.attempts, 1);
    assert_eq!(provider.calls(), 5);

    // 同一份评分细则在所有批次中哈希一致
    assert_eq!(report.rubric_hash.len(), 64);
    for summary in &report.dispatch.batches {
        assert_eq!(summary.completed, summary.total);
    }
}

#[tokio::test]
async fn test_one_failed_student_does_not_affect_others() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), provider);
    let sub = submission("exam-2", &[("alice", ""), ("bob", "GARBAGE"), ("carol", "")]);

    let report = app.process_submission(&sub).await.unwrap();

    assert_eq!(report.dispatch.count(JobStatus::Completed), 2);
    assert_eq!(report.dispatch.count(JobStatus::Failed), 1);
    let bob = &report.dispatch.jobs["bob"];
    assert_eq!(bob.attempts, 1);
    assert!(bob.error.is_some());
    assert_eq!(app.errors().count(ErrorKind::JobFailed), 1);
    assert_eq!(app.errors().count(ErrorKind::ProviderTransientFailure), 0);
}

#[tokio::test]
async fn test_low_confidence_goes_to_review_queue() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), provider);
    let sub = submission("exam-3", &[("alice", ""), ("bob", "UNSURE")]);

    let report = app.process_submission(&sub).await.unwrap();

    assert_eq!(report.dispatch.count(JobStatus::Completed), 2);
    let job_reviews: Vec<_> = app
        .review()
        .snapshot()
        .into_iter()
        .filter(|item| item.source == ReviewSource::Job)
        .collect();
    assert_eq!(job_reviews.len(), 1);
    assert_eq!(job_reviews[0].student_key, "bob");
    assert_eq!(job_reviews[0].submission_id, "exam-3");
    assert_eq!(report.dispatch.jobs["bob"].confidence, Some(0.3));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), Arc::clone(&provider));
    let sub = submission("exam-4", &[("alice", "FLAKY")]);

    let report = app.process_submission(&sub).await.unwrap();

    let alice = &report.dispatch.jobs["alice"];
    assert_eq!(alice.status, JobStatus::Completed);
    assert_eq!(alice.attempts, 3);
    assert_eq!(provider.calls(), 3);
    assert_eq!(app.errors().count(ErrorKind::ProviderTransientFailure), 2);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let (provider, _started) = ScriptedProvider::new();
    let config = Config {
        max_attempts: 2,
        ..test_config()
    };
    let app = app_with(config, Arc::clone(&provider));
    let sub = submission("exam-5", &[("alice", "FLAKY")]);

    let report = app.process_submission(&sub).await.unwrap();

    let alice = &report.dispatch.jobs["alice"];
    assert_eq!(alice.status, JobStatus::Failed);
    assert_eq!(alice.attempts, 2);
    assert_eq!(app.errors().count(ErrorKind::JobFailed), 1);
}

#[tokio::test]
async fn test_second_run_hits_grade_cache() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), Arc::clone(&provider));
    let sub = submission("exam-6", &[("alice", ""), ("bob", "")]);

    let first = app.process_submission(&sub).await.unwrap();
    assert_eq!(provider.calls(), 2);

    let second = app.process_submission(&sub).await.unwrap();
    assert_eq!(provider.calls(), 2);
    assert_eq!(second.dispatch.count(JobStatus::Completed), 2);
    for (key, job) in &second.dispatch.jobs {
        assert_eq!(job.attempts, 0, "{} 应命中缓存", key);
        assert_eq!(job.result, first.dispatch.jobs[key].result);
    }
    assert!(app.cache().stats().local_hits > 0);
}

#[tokio::test]
async fn test_drain_cancel_lets_running_job_finish() {
    let (provider, mut started) = ScriptedProvider::new();
    let config = Config {
        max_batch_size: 10,
        workers_per_batch: 1,
        cancel_policy: CancelPolicy::Drain,
        ..test_config()
    };
    let app = Arc::new(app_with(config, Arc::clone(&provider)));
    let sub = submission("drain", &[("alice", "SLOW"), ("bob", ""), ("carol", "")]);

    let runner = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.process_submission(&sub).await })
    };

    started.recv().await.unwrap();
    let running = app.dispatcher().progress("drain-b000").unwrap();
    assert_eq!(running.total, 3);
    assert_eq!(running.completed, 0);
    app.dispatcher().cancel("drain-b000");
    provider.release.notify_one();

    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.dispatch.jobs["alice"].status, JobStatus::Completed);
    assert_eq!(report.dispatch.jobs["bob"].status, JobStatus::Queued);
    assert_eq!(report.dispatch.jobs["carol"].status, JobStatus::Queued);
    assert_eq!(provider.calls(), 1);

    let summary = &report.dispatch.batches[0];
    assert_eq!(summary.batch_id, "drain-b000");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.queued, 2);
    // 派发结束后不再保留批次控制信息
    assert!(app.dispatcher().progress("drain-b000").is_none());
}

#[tokio::test]
async fn test_abort_cancel_interrupts_running_jobs() {
    let (provider, mut started) = ScriptedProvider::new();
    let config = Config {
        max_batch_size: 10,
        workers_per_batch: 2,
        cancel_policy: CancelPolicy::Abort,
        ..test_config()
    };
    let app = Arc::new(app_with(config, Arc::clone(&provider)));
    let sub = submission("abort", &[("alice", "SLOW"), ("bob", "SLOW"), ("carol", "")]);

    let runner = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.process_submission(&sub).await })
    };

    started.recv().await.unwrap();
    started.recv().await.unwrap();
    app.dispatcher().cancel("abort-b000");

    let report = runner.await.unwrap().unwrap();
    for key in ["alice", "bob"] {
        let job = &report.dispatch.jobs[key];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));
    }
    assert_eq!(report.dispatch.jobs["carol"].status, JobStatus::Queued);
    assert_eq!(app.errors().count(ErrorKind::JobFailed), 2);
}

#[tokio::test]
async fn test_invalid_rubric_fails_submission() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), Arc::clone(&provider));
    let mut sub = submission("exam-7", &[("alice", "")]);
    sub.rubric = RubricUnderstanding::new(Vec::new());

    let err = app.process_submission(&sub).await.unwrap_err();

    assert!(matches!(err, AppError::Rubric(_)));
    assert_eq!(app.errors().count(ErrorKind::RubricInvalid), 1);
    assert!(app.errors().has_fatal());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_planning_errors_fail_submission() {
    let (provider, _started) = ScriptedProvider::new();
    let app = app_with(test_config(), Arc::clone(&provider));
    let empty = submission("exam-8", &[]);

    let err = app.process_submission(&empty).await.unwrap_err();
    assert!(matches!(err, AppError::Planning(PlanningError::NoStudents)));

    let config = Config {
        max_batch_size: 0,
        ..test_config()
    };
    let app = app_with(config, Arc::clone(&provider));
    let err = app
        .process_submission(&submission("exam-9", &[("alice", "")]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Planning(PlanningError::ZeroBatchSize)));
    assert_eq!(app.errors().count(ErrorKind::PlanningInvalid), 1);
    assert_eq!(provider.calls(), 0);
}

const SUBMISSION_TOML: &str = r#"
submission_id = "exam-10"
name = "期中考试"

[[pages]]
page_index = 0
question_numbers = [1]
text = "alice answer one"
identity = { name = "Alice", confidence = 0.95 }

[[pages]]
page_index = 1
question_numbers = [2]
text = "alice answer two"
identity = { name = "Alice", confidence = 0.95 }

[[pages]]
page_index = 2
question_numbers = [1]
text = "bob answer one"
identity = { name = "Bob", confidence = 0.95 }

[[pages]]
page_index = 3
question_numbers = [2]
text = "bob answer two"
identity = { name = "Bob", confidence = 0.95 }

[rubric]
total_points = 10

[[rubric.criteria]]
id = "c1"
description = "Correct derivative of the polynomial"
points = 6
keywords = ["derivative"]

[[rubric.criteria]]
id = "c2"
description = "States the final answer with units"
points = 4
required_elements = ["final answer"]
"#;

#[tokio::test]
async fn test_run_writes_results_and_uses_warmup() {
    let dir = std::env::temp_dir().join(format!("batch_grading_run_{}", std::process::id()));
    let submissions = dir.join("submissions");
    let results = dir.join("results");
    std::fs::create_dir_all(&submissions).unwrap();

    std::fs::write(submissions.join("exam-10.toml"), SUBMISSION_TOML).unwrap();

    let config = Config {
        submission_folder: submissions.to_string_lossy().to_string(),
        results_folder: results.to_string_lossy().to_string(),
        output_log_file: dir.join("log.txt").to_string_lossy().to_string(),
        ..test_config()
    };
    let (provider, _started) = ScriptedProvider::new();
    logger::init();
    let app = App::with_components(
        config,
        Arc::clone(&provider) as Arc<dyn InferenceProvider>,
        Arc::new(InMemoryKvStore::new()),
        Some(Arc::new(InMemoryDurableStore::new(Vec::new()))),
        Arc::new(ReviewQueue::in_memory()),
    );

    let stats = app.run().await.unwrap();

    assert_eq!(stats.submissions, 1);
    assert_eq!(stats.failed_submissions, 0);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);

    let written = std::fs::read_to_string(results.join("exam-10.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(json["submission_id"], "exam-10");
    assert_eq!(json["dispatch"]["jobs"]["alice"]["status"], "completed");

    let log = std::fs::read_to_string(dir.join("log.txt")).unwrap();
    assert!(log.contains("exam-10 | 学生 2 | 完成 2"));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_provider_timeouts_are_retried_then_fail() {
    let (provider, _started) = ScriptedProvider::new();
    let config = Config {
        max_attempts: 2,
        provider_timeout_secs: 1,
        ..test_config()
    };
    let app = app_with(config, Arc::clone(&provider));
    let sub = submission("exam-11", &[("alice", "HANG"), ("bob", "")]);

    let report = app.process_submission(&sub).await.unwrap();

    let alice = &report.dispatch.jobs["alice"];
    assert_eq!(alice.status, JobStatus::Failed);
    assert_eq!(alice.attempts, 2);
    assert!(alice.error.as_deref().unwrap().contains("超时"));
    assert_eq!(report.dispatch.jobs["bob"].status, JobStatus::Completed);
    assert_eq!(app.errors().count(ErrorKind::ProviderTransientFailure), 2);
    assert_eq!(app.errors().count(ErrorKind::JobFailed), 1);
}

#[tokio::test]
async fn test_single_batch_respects_worker_limit() {
    let (provider, _started) = ScriptedProvider::new();
    let config = Config {
        max_batch_size: 10,
        max_parallel_batches: 1,
        workers_per_batch: 2,
        ..test_config()
    };
    let app = app_with(config, Arc::clone(&provider));
    let students: Vec<(String, &str)> = (0..6).map(|i| (format!("s{}", i), "HOLD")).collect();
    let students: Vec<(&str, &str)> = students.iter().map(|(n, m)| (n.as_str(), *m)).collect();
    let sub = submission("exam-12", &students);

    let report = app.process_submission(&sub).await.unwrap();

    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.dispatch.count(JobStatus::Completed), 6);
    assert_eq!(provider.peak(), 2);
}

#[tokio::test]
async fn test_parallel_batches_respect_batch_limit() {
    let (provider, _started) = ScriptedProvider::new();
    let config = Config {
        max_batch_size: 2,
        max_parallel_batches: 2,
        workers_per_batch: 1,
        ..test_config()
    };
    let app = app_with(config, Arc::clone(&provider));
    let students: Vec<(String, &str)> = (0..6).map(|i| (format!("s{}", i), "HOLD")).collect();
    let students: Vec<(&str, &str)> = students.iter().map(|(n, m)| (n.as_str(), *m)).collect();
    let sub = submission("exam-13", &students);

    let report = app.process_submission(&sub).await.unwrap();

    // 3 个批次，同时最多 2 个批次、每批 1 个工作者
    assert_eq!(report.batches.len(), 3);
    assert_eq!(report.dispatch.count(JobStatus::Completed), 6);
    assert_eq!(provider.peak(), 2);
}

#[tokio::test]
async fn test_undecodable_shared_rubric_is_recompiled() {
    let (provider, _started) = ScriptedProvider::new();
    let shared = Arc::new(InMemoryKvStore::new());
    let rubric_key = format!("rubric:{}", RubricCompiler::rubric_hash(&rubric()).unwrap());
    shared
        .set(&rubric_key, br#"{"old_schema":true}"#, Duration::from_secs(60))
        .await
        .unwrap();

    logger::init();
    let app = App::with_components(
        test_config(),
        Arc::clone(&provider) as Arc<dyn InferenceProvider>,
        Arc::clone(&shared) as Arc<dyn SharedKvStore>,
        None,
        Arc::new(ReviewQueue::in_memory()),
    );
    let sub = submission("exam-14", &[("alice", ""), ("bob", "")]);

    let report = app.process_submission(&sub).await.unwrap();

    assert_eq!(report.dispatch.count(JobStatus::Completed), 2);
    assert!(app.errors().count(ErrorKind::CacheUnavailable) >= 1);
    assert_eq!(app.errors().count(ErrorKind::RubricInvalid), 0);

    // 共享层里的旧条目已被正确的评分细则包替换
    let stored = shared.get(&rubric_key).await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    assert_eq!(json["rubric_hash"], report.rubric_hash.as_str());
}

#[tokio::test]
async fn test_undecodable_cached_grade_is_regraded() {
    let (provider, _started) = ScriptedProvider::new();
    let shared = Arc::new(InMemoryKvStore::new());
    let rubric_hash = RubricCompiler::rubric_hash(&rubric()).unwrap();
    let alice_content = "--- page 0 ---\nalice answer one\n--- page 1 ---\nalice answer two";
    shared
        .set(
            &grade_cache_key(&rubric_hash, alice_content),
            br#"{"score":7}"#,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    logger::init();
    let app = App::with_components(
        test_config(),
        Arc::clone(&provider) as Arc<dyn InferenceProvider>,
        shared,
        None,
        Arc::new(ReviewQueue::in_memory()),
    );
    let sub = submission("exam-15", &[("alice", "")]);

    let report = app.process_submission(&sub).await.unwrap();

    assert_eq!(report.rubric_hash, rubric_hash);
    let alice = &report.dispatch.jobs["alice"];
    assert_eq!(alice.status, JobStatus::Completed);
    assert_eq!(alice.attempts, 1);
    assert_eq!(provider.calls(), 1);
    assert!(app.errors().count(ErrorKind::CacheUnavailable) >= 1);
}
