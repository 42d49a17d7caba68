use serde::{Deserialize, Serialize};

use crate::models::batch::StudentRef;
use crate::models::page::PageSignal;
use crate::models::rubric::RubricUnderstanding;

/// 一份多学生扫描提交
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    #[serde(deserialize_with = "deserialize_submission_id")]
    pub submission_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pages: Vec<PageSignal>,
    pub rubric: RubricUnderstanding,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}

impl Submission {
    /// 拼接某个学生范围内所有页面的文本，作为评分内容
    pub fn content_for(&self, student: &StudentRef) -> String {
        self.pages
            .iter()
            .filter(|p| (student.start_page..=student.end_page).contains(&p.page_index))
            .map(|p| {
                let body = p.text.as_deref().unwrap_or("").trim();
                format!("--- page {} ---\n{}", p.page_index, body)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// 提交编号既可以写成字符串，也可以写成整数
fn deserialize_submission_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Visitor;
    use std::fmt;

    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or integer submission id")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_from_toml_with_integer_id() {
        let text = r#"
submission_id = 2024
name = "期中考试 三班"

[[pages]]
page_index = 0
question_numbers = [1, 2]
text = "1. x = 2"

[[pages]]
page_index = 1
question_numbers = [3]
text = "3. 证明略"

[rubric]
[[rubric.criteria]]
id = "c1"
description = "解方程"
points = 4
keywords = ["方程"]
required_elements = ["x = 2"]
"#;
        let submission: Submission = toml::from_str(text).unwrap();
        assert_eq!(submission.submission_id, "2024");
        assert_eq!(submission.pages.len(), 2);
        assert_eq!(submission.rubric.criteria[0].points.hundredths(), 400);

        let student = StudentRef {
            student_key: "student-001".into(),
            start_page: 0,
            end_page: 1,
            estimated_tokens: 0,
        };
        let content = submission.content_for(&student);
        assert!(content.contains("x = 2"));
        assert!(content.contains("--- page 1 ---"));
    }
}
