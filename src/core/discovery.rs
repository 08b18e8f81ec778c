use anyhow::Result;
use async_trait::async_trait;
use glob::Pattern;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::error::EstimateError;
use crate::core::iac::IacType;

/// Lists files changed relative to a base ref, repository-root-relative.
#[async_trait]
pub trait ChangedFilesProvider: Send + Sync {
    async fn list_changed_files(&self, base_ref: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub base_ref: String,
    pub exclude_paths: Vec<String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            base_ref: "main".to_string(),
            exclude_paths: Vec::new(),
        }
    }
}

/// Finds the project roots touched by the changes since `options.base_ref`.
/// Provider failures are fatal for the whole run.
pub async fn discover(
    provider: &dyn ChangedFilesProvider,
    iac_type: IacType,
    options: &DiscoveryOptions,
) -> Result<Vec<PathBuf>, EstimateError> {
    let files = provider
        .list_changed_files(&options.base_ref)
        .await
        .map_err(|cause| EstimateError::Discovery { iac_type, cause })?;
    debug!("{} changed files relative to {}", files.len(), options.base_ref);

    let roots = group_into_roots(&files, iac_type, &options.exclude_paths);
    info!(
        "Found {} {} director{}",
        roots.len(),
        iac_type.display_name(),
        if roots.len() == 1 { "y" } else { "ies" }
    );
    for root in &roots {
        info!("  {}", root.display());
    }
    Ok(roots)
}

/// Reduces changed files to the distinct directories holding an IaC marker,
/// in first-seen order.
pub fn group_into_roots(files: &[String], iac_type: IacType, exclude_paths: &[String]) -> Vec<PathBuf> {
    let excludes: Vec<Pattern> = exclude_paths
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut seen = HashSet::new();
    let mut roots = Vec::new();

    for file in files.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
        let path = Path::new(file);
        if !iac_type.is_marker(path) {
            continue;
        }
        if excludes.iter().any(|pattern| pattern.matches_path(path)) {
            debug!("Excluded {}", file);
            continue;
        }

        let root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if seen.insert(root.clone()) {
            roots.push(root);
        }
    }

    roots
}
