//! 基础设施层（Infrastructure）
//!
//! 持有进程外资源的接口：推理服务、共享键值缓存、持久化存储。
//! 只暴露能力，不认识学生、批次或评分细则。

pub mod durable_store;
pub mod kv_store;
pub mod provider;

pub use durable_store::{DurableStore, InMemoryDurableStore, JsonlDurableStore, PriorResult};
pub use kv_store::{HttpKvStore, InMemoryKvStore, SharedKvStore};
pub use provider::{estimate_tokens, ContextHandle, GenerationRequest, InferenceProvider};
