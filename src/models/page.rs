use serde::{Deserialize, Serialize};

/// 单页的身份识别候选（姓名 / 学号）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCandidate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    pub confidence: f64,
}

impl IdentityCandidate {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            student_id: None,
            confidence,
        }
    }

    pub fn with_student_id(mut self, student_id: impl Into<String>) -> Self {
        self.student_id = Some(student_id.into());
        self
    }

    /// 用于比较身份的规范化键
    ///
    /// 有学号时使用学号，否则使用小写、合并空白后的姓名
    pub fn normalized_key(&self) -> String {
        if let Some(id) = self.student_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return id.to_lowercase();
        }
        self.name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

/// 文档解析给出的单页信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSignal {
    pub page_index: usize,
    /// 按出现顺序识别到的题号
    #[serde(default)]
    pub question_numbers: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityCandidate>,
    /// 页面提取的文本（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl PageSignal {
    pub fn new(page_index: usize) -> Self {
        Self {
            page_index,
            question_numbers: Vec::new(),
            identity: None,
            text: None,
        }
    }

    pub fn with_questions(mut self, numbers: impl IntoIterator<Item = u32>) -> Self {
        self.question_numbers = numbers.into_iter().collect();
        self
    }

    pub fn with_identity(mut self, identity: IdentityCandidate) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn leading_question(&self) -> Option<u32> {
        self.question_numbers.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_key_prefers_student_id() {
        let a = IdentityCandidate::new("Li  Wei", 0.9).with_student_id(" S-001 ");
        let b = IdentityCandidate::new("li wei", 0.7);
        assert_eq!(a.normalized_key(), "s-001");
        assert_eq!(b.normalized_key(), "li wei");
        assert_eq!(IdentityCandidate::new("LI   WEI", 0.7).normalized_key(), b.normalized_key());
    }
}
