pub mod batch;
pub mod boundary;
pub mod job;
pub mod loaders;
pub mod page;
pub mod rubric;
pub mod submission;

pub use batch::{Batch, StudentRef};
pub use boundary::{BoundaryDetectionResult, DetectionMethod, StudentBoundary};
pub use job::{
    CriterionAward, GradingJob, GradingOutcome, JobStatus, ReviewItem, ReviewSource,
};
pub use loaders::{load_all_submissions, load_submission};
pub use page::{IdentityCandidate, PageSignal};
pub use rubric::{
    CompressedCriterion, CompressedRubricPackage, DecisionRule, Points, RubricCriterion,
    RubricUnderstanding, RuleBasis, ScoreBand,
};
pub use submission::Submission;
