use crate::models::submission::Submission;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载一份提交
pub async fn load_submission(toml_file_path: &Path) -> Result<Submission> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut submission: Submission = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    submission.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(submission)
}

/// 从文件夹中加载所有提交（按文件名排序，单个文件失败只告警）
pub async fn load_all_submissions(folder_path: &str) -> Result<Vec<Submission>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut submissions = Vec::new();
    for path in toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_submission(&path).await {
            Ok(submission) => {
                tracing::info!(
                    "成功加载提交 {}，共 {} 页",
                    submission.submission_id,
                    submission.pages.len()
                );
                submissions.push(submission);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(submissions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
submission_id = "s-1"

[[pages]]
page_index = 0
question_numbers = [1]

[rubric]
[[rubric.criteria]]
id = "c1"
description = "d"
points = 1
"#;

    #[tokio::test]
    async fn test_load_all_submissions_skips_broken_files() {
        let dir = std::env::temp_dir().join(format!("batch_grading_loader_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.toml"), SAMPLE).unwrap();
        std::fs::write(dir.join("b.toml"), "this is not toml = = =").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let submissions = load_all_submissions(dir.to_str().unwrap()).await.unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].submission_id, "s-1");
        assert!(submissions[0].file_path.as_deref().unwrap().ends_with("a.toml"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_load_all_submissions_missing_folder() {
        assert!(load_all_submissions("/definitely/not/here").await.is_err());
    }
}
