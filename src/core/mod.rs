pub mod backend;
pub mod comment;
pub mod discovery;
pub mod error;
pub mod estimator;
pub mod git;
pub mod iac;
pub mod pipeline;
pub mod prompt;
pub mod report;
pub mod runner;

pub use backend::{BackendPreset, BackendProfile, ChatBackend};
pub use comment::{CommentPoster, GitHubCommentPoster};
pub use estimator::{create_estimator, Estimator, EstimatorContext};
pub use git::GitIntegration;
pub use iac::IacType;
pub use pipeline::{EstimationPipeline, PipelineOptions};
pub use prompt::PromptTemplates;
pub use report::{render_markdown, CostAggregator, CostReport};
pub use runner::ProcessRunner;
