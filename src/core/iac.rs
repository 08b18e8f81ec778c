use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::core::error::EstimateError;

/// The IaC tools an estimator exists for. The lowercase name doubles as the
/// prompt-template tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IacType {
    Terraform,
    Pulumi,
}

impl IacType {
    pub const ALL: [IacType; 2] = [IacType::Terraform, IacType::Pulumi];

    pub fn as_str(&self) -> &'static str {
        match self {
            IacType::Terraform => "terraform",
            IacType::Pulumi => "pulumi",
        }
    }

    /// Human-facing name used inside prompts.
    pub fn display_name(&self) -> &'static str {
        match self {
            IacType::Terraform => "Terraform",
            IacType::Pulumi => "Pulumi",
        }
    }

    /// Whether a changed file marks its directory as a project root.
    pub fn is_marker(&self, path: &Path) -> bool {
        match self {
            IacType::Terraform => path.extension().map_or(false, |ext| ext == "tf"),
            IacType::Pulumi => path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name == "Pulumi.yaml" || name == "Pulumi.yml"),
        }
    }

    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for IacType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IacType {
    type Err = EstimateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "terraform" => Ok(IacType::Terraform),
            "pulumi" => Ok(IacType::Pulumi),
            _ => Err(EstimateError::UnsupportedStack {
                stack: s.to_string(),
                supported: Self::supported_list(),
            }),
        }
    }
}
