use anyhow::Result;
/// 日志工具模块
///
/// 提供日志格式化和输出的辅助函数
use std::fs::{self, OpenOptions};
use std::io::Write;
use tracing::info;

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n批量评分日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 向日志文件追加一行
pub fn append_log_line(log_file_path: &str, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(max_parallel_batches: usize, workers_per_batch: usize, model: &str) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 批量评分模式");
    info!("📊 并行批次上限: {}，每批并发: {}", max_parallel_batches, workers_per_batch);
    info!("🤖 模型: {}", model);
    info!("{}", "=".repeat(60));
}

/// 记录提交加载信息
pub fn log_submissions_loaded(total: usize) {
    info!("✓ 找到 {} 份待评分的提交", total);
    info!("💡 每份提交内部按批次并行评分\n");
}

/// 记录单份提交开始
///
/// # 参数
/// - `index`: 提交序号（从1开始）
/// - `total`: 提交总数
/// - `submission_id`: 提交编号
/// - `pages`: 页数
pub fn log_submission_start(index: usize, total: usize, submission_id: &str, pages: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📄 开始处理第 {}/{} 份提交: {}", index, total, submission_id);
    info!("📑 共 {} 页", pages);
    info!("{}", "=".repeat(60));
}

/// 打印最终统计信息
pub fn print_final_stats(
    submissions: usize,
    failed_submissions: usize,
    completed: usize,
    failed: usize,
    queued: usize,
    review: usize,
    log_file_path: &str,
) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!(
        "📄 提交: {}（失败 {}）",
        submissions, failed_submissions
    );
    info!("✅ 评分完成: {}", completed);
    info!("❌ 评分失败: {}", failed);
    info!("⏸️ 未派发: {}", queued);
    info!("🔎 待复核: {}", review);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本，截断标记 `...` 计入长度上限
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大字符数
pub fn truncate_text(text: &str, max_len: usize) -> String {
    const MARKER: &str = "...";
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    if max_len <= MARKER.len() {
        return text.chars().take(max_len).collect();
    }
    text.chars().take(max_len - MARKER.len()).collect::<String>() + MARKER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_marker() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdefghij", 10), "abcdefghij");
        assert_eq!(truncate_text("abcdefghijk", 10), "abcdefg...");
        assert_eq!(truncate_text("评分细则描述很长很长", 6), "评分细...");
        assert_eq!(truncate_text("abcdef", 2), "ab");
    }

    #[test]
    fn test_log_file_header_and_append() {
        let path = std::env::temp_dir().join(format!("batch_grading_log_{}.txt", std::process::id()));
        let path = path.to_string_lossy().to_string();
        init_log_file(&path).unwrap();
        append_log_line(&path, "exam-1: 3/3").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("批量评分日志"));
        assert!(content.ends_with("exam-1: 3/3\n"));
        fs::remove_file(&path).unwrap();
    }
}
