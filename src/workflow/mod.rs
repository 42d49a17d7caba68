pub mod grading_flow;
pub mod job_ctx;
pub mod retry;

pub use grading_flow::{
    grade_cache_key, parse_outcome, BatchContext, FlowFailure, FlowSuccess, GradingFlow,
};
pub use job_ctx::JobCtx;
pub use retry::RetryPolicy;
