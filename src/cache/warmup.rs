//! 启动预热
//!
//! 从持久化存储分页读取近期的高置信度结果，写入第一、二层缓存。

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::CacheManager;
use crate::error::{Component, ErrorKind};
use crate::infrastructure::DurableStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    /// 新写入的条目
    pub loaded: usize,
    /// 已存在而跳过的条目
    pub skipped: usize,
    /// 读取的页数
    pub pages: usize,
    /// 是否因存储故障提前结束
    pub interrupted: bool,
}

pub(super) async fn run(manager: Arc<CacheManager>, store: Arc<dyn DurableStore>) -> WarmupReport {
    let settings = manager.settings().clone();
    let since = Utc::now() - Duration::days(settings.warmup_lookback_days);
    let page_size = settings.warmup_batch_size.max(1);
    let mut report = WarmupReport::default();
    let mut offset = 0;

    loop {
        let rows = match store
            .recent_results(since, settings.warmup_min_confidence, offset, page_size)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("⚠️ 缓存预热中断: {}", e);
                manager.errors().record(
                    Component::CacheManager,
                    ErrorKind::CacheUnavailable,
                    format!("warmup: {}", e),
                );
                report.interrupted = true;
                break;
            }
        };

        if rows.is_empty() {
            break;
        }
        report.pages += 1;

        for row in &rows {
            if manager.put(&row.cache_key, row.value.as_bytes()).await {
                report.loaded += 1;
            } else {
                report.skipped += 1;
            }
        }

        if rows.len() < page_size {
            break;
        }
        offset += rows.len();
    }

    info!(
        "🔥 缓存预热完成: 写入 {} 条，跳过 {} 条，共 {} 页",
        report.loaded, report.skipped, report.pages
    );
    report
}
