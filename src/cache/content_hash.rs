//! 内容寻址
//!
//! 缓存键形如 `{namespace}:{sha256 hex}`，跨进程、跨运行稳定。

use std::fmt::Write as _;

use serde::Serialize;
use sha2::{Digest, Sha256};

pub struct ContentHasher;

impl ContentHasher {
    pub fn hash(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    pub fn hash_hex(bytes: &[u8]) -> String {
        Self::hash(bytes)
            .iter()
            .fold(String::with_capacity(64), |mut out, byte| {
                let _ = write!(out, "{:02x}", byte);
                out
            })
    }

    /// 规范文本：serde_json 序列化结果，字段顺序跟随类型定义
    pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(value)
    }
}

pub fn cache_key(namespace: &str, bytes: &[u8]) -> String {
    format!("{}:{}", namespace, ContentHasher::hash_hex(bytes))
}
