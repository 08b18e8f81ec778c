//! Failure taxonomy of the estimation pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::iac::IacType;

#[derive(Error, Debug)]
pub enum EstimateError {
    /// The changed-file listing itself failed (fetch, auth, missing ref).
    #[error("Failed to find {iac_type} directories: {cause:#}")]
    Discovery {
        iac_type: IacType,
        cause: anyhow::Error,
    },

    #[error("No {0} directories found in the changed files")]
    NoDirectoriesFound(IacType),

    #[error("Failed to generate {iac_type} preview in {}: {cause:#}", .root.display())]
    PreviewGeneration {
        iac_type: IacType,
        root: PathBuf,
        cause: anyhow::Error,
    },

    #[error("Failed to analyze preview: {0}")]
    AnalysisFailed(#[source] Box<EstimateError>),

    #[error("No prompt configured for IaC type: {0}")]
    UnknownIacType(String),

    #[error("{provider} API error: {message}")]
    BackendRequest { provider: String, message: String },

    #[error("IaC stack '{stack}' is not supported. Supported stacks are: {supported}")]
    UnsupportedStack { stack: String, supported: String },
}

impl EstimateError {
    pub fn analysis_failed(cause: EstimateError) -> Self {
        match cause {
            // Never double-wrap
            already @ EstimateError::AnalysisFailed(_) => already,
            other => EstimateError::AnalysisFailed(Box::new(other)),
        }
    }
}
