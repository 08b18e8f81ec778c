use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{DiffOptions, Object, Repository};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::discovery::ChangedFilesProvider;

/// Changed-file listing backed by the local git checkout, equivalent to
/// `git diff --name-only origin/<base>`.
pub struct GitIntegration {
    repo_path: PathBuf,
    remote: String,
    fetch_base: bool,
}

impl GitIntegration {
    /// The repository is located lazily, on the first listing.
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            remote: "origin".to_string(),
            fetch_base: true,
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::discover(&self.repo_path).with_context(|| {
            format!("Failed to find git repository at {}", self.repo_path.display())
        })
    }

    pub fn with_fetch(mut self, fetch_base: bool) -> Self {
        self.fetch_base = fetch_base;
        self
    }

    async fn fetch(&self, workdir: &Path, base_ref: &str) -> Result<()> {
        info!("Fetching {} from {}", base_ref, self.remote);
        let output = tokio::process::Command::new("git")
            .args(["fetch", &self.remote, base_ref])
            .current_dir(workdir)
            .output()
            .await
            .context("Failed to run git fetch")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git fetch {} {} failed: {}", self.remote, base_ref, stderr.trim());
        }
        Ok(())
    }

    fn resolve_base<'r>(&self, repo: &'r Repository, base_ref: &str) -> Result<Object<'r>> {
        let remote_ref = format!("{}/{}", self.remote, base_ref);
        repo.revparse_single(&remote_ref)
            .or_else(|_| repo.revparse_single(base_ref))
            .with_context(|| format!("Unable to resolve base ref '{}'", base_ref))
    }

    pub fn changed_paths(&self, base_ref: &str) -> Result<Vec<String>> {
        let repo = self.open()?;
        let base_tree = self.resolve_base(&repo, base_ref)?.peel_to_tree()?;

        let mut diff_options = DiffOptions::new();
        let diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut diff_options))?;

        let mut paths = Vec::new();
        for delta in diff.deltas() {
            let path = delta.new_file().path().or_else(|| delta.old_file().path());
            if let Some(path) = path {
                paths.push(path.to_string_lossy().replace('\\', "/"));
            }
        }
        debug!("git reports {} changed paths against {}", paths.len(), base_ref);
        Ok(paths)
    }
}

#[async_trait]
impl ChangedFilesProvider for GitIntegration {
    async fn list_changed_files(&self, base_ref: &str) -> Result<Vec<String>> {
        if self.fetch_base {
            let workdir = {
                let repo = self.open()?;
                repo.workdir()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| repo.path().to_path_buf())
            };
            self.fetch(&workdir, base_ref).await?;
        }
        self.changed_paths(base_ref)
    }
}
