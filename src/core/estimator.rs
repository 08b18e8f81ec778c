use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::backend::LlmBackend;
use crate::core::discovery::{discover, ChangedFilesProvider, DiscoveryOptions};
use crate::core::error::EstimateError;
use crate::core::iac::IacType;
use crate::core::runner::CommandRunner;

const TERRAFORM_PLAN_FILE: &str = "tfplan";

/// One IaC tool's answer to "which roots changed" and "what would change
/// there". Interpretation is left to the backend, so any estimator pairs
/// with any backend.
#[async_trait]
pub trait Estimator: Send + Sync {
    fn iac_type(&self) -> IacType;

    async fn find_directories(&self) -> Result<Vec<PathBuf>, EstimateError>;

    async fn generate_preview(&self, root: &Path) -> Result<String, EstimateError>;

    /// Preview `root`, ask the backend, and return its answer with any
    /// code fence removed.
    async fn analyze_root(&self, root: &Path, backend: &dyn LlmBackend) -> Result<String, EstimateError> {
        let run = async {
            let preview = self.generate_preview(root).await?;
            info!(
                "Generated {} preview for {} ({} bytes)",
                self.iac_type().display_name(),
                root.display(),
                preview.len()
            );
            let answer = backend.get_response(&preview, self.iac_type().as_str()).await?;
            Ok::<_, EstimateError>(strip_code_fences(&answer))
        };
        run.await.map_err(EstimateError::analysis_failed)
    }

    /// Single-root analysis: the explicit root, or else the first discovered
    /// one. Finding nothing fails before the backend is contacted.
    async fn analyze(&self, explicit_root: Option<&Path>, backend: &dyn LlmBackend) -> Result<String, EstimateError> {
        let root = match explicit_root {
            Some(root) => root.to_path_buf(),
            None => {
                let roots = self.find_directories().await?;
                let mut roots = roots.into_iter();
                let first = roots
                    .next()
                    .ok_or(EstimateError::NoDirectoriesFound(self.iac_type()))?;
                let ignored = roots.count();
                if ignored > 0 {
                    warn!("Analyzing {} only; {} more root(s) ignored", first.display(), ignored);
                }
                first
            }
        };
        self.analyze_root(&root, backend).await
    }
}

/// Collaborators shared by the estimator variants.
#[derive(Clone)]
pub struct EstimatorContext {
    pub changes: Arc<dyn ChangedFilesProvider>,
    pub runner: Arc<dyn CommandRunner>,
    pub discovery: DiscoveryOptions,
}

#[derive(Debug, Clone)]
pub struct PulumiSettings {
    pub stack: String,
    pub passphrase: String,
}

impl Default for PulumiSettings {
    fn default() -> Self {
        Self {
            stack: "dev".to_string(),
            passphrase: "dummy-passphrase".to_string(),
        }
    }
}

pub fn create_estimator(
    iac_type: IacType,
    context: EstimatorContext,
    pulumi: PulumiSettings,
) -> Arc<dyn Estimator> {
    match iac_type {
        IacType::Terraform => Arc::new(TerraformEstimator::new(context)),
        IacType::Pulumi => Arc::new(PulumiEstimator::new(context, pulumi)),
    }
}

pub struct TerraformEstimator {
    context: EstimatorContext,
}

impl TerraformEstimator {
    pub fn new(context: EstimatorContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Estimator for TerraformEstimator {
    fn iac_type(&self) -> IacType {
        IacType::Terraform
    }

    async fn find_directories(&self) -> Result<Vec<PathBuf>, EstimateError> {
        discover(self.context.changes.as_ref(), self.iac_type(), &self.context.discovery).await
    }

    async fn generate_preview(&self, root: &Path) -> Result<String, EstimateError> {
        let runner = self.context.runner.as_ref();
        let preview_error = |cause: anyhow::Error| EstimateError::PreviewGeneration {
            iac_type: IacType::Terraform,
            root: root.to_path_buf(),
            cause,
        };

        runner
            .run("terraform", &["init", "-input=false"], root, &[])
            .await
            .map_err(preview_error)?;
        let plan_arg = format!("-out={}", TERRAFORM_PLAN_FILE);
        runner
            .run("terraform", &["plan", "-input=false", plan_arg.as_str()], root, &[])
            .await
            .map_err(preview_error)?;

        let shown = runner
            .run("terraform", &["show", "-json", TERRAFORM_PLAN_FILE], root, &[])
            .await;

        // The plan artifact never outlives this call
        let plan_path = root.join(TERRAFORM_PLAN_FILE);
        let removed = tokio::fs::remove_file(&plan_path)
            .await
            .with_context(|| format!("Failed to remove plan artifact {}", plan_path.display()));

        match (shown, removed) {
            (Ok(plan_json), Ok(())) => Ok(plan_json),
            (Ok(_), Err(cleanup)) => Err(preview_error(cleanup)),
            (Err(show), removed) => {
                if let Err(cleanup) = removed {
                    warn!("{:#}", cleanup);
                }
                Err(preview_error(show))
            }
        }
    }
}

pub struct PulumiEstimator {
    context: EstimatorContext,
    settings: PulumiSettings,
}

impl PulumiEstimator {
    pub fn new(context: EstimatorContext, settings: PulumiSettings) -> Self {
        Self { context, settings }
    }
}

#[async_trait]
impl Estimator for PulumiEstimator {
    fn iac_type(&self) -> IacType {
        IacType::Pulumi
    }

    async fn find_directories(&self) -> Result<Vec<PathBuf>, EstimateError> {
        discover(self.context.changes.as_ref(), self.iac_type(), &self.context.discovery).await
    }

    async fn generate_preview(&self, root: &Path) -> Result<String, EstimateError> {
        let runner = self.context.runner.as_ref();
        let envs = [("PULUMI_CONFIG_PASSPHRASE", self.settings.passphrase.as_str())];
        let stack = self.settings.stack.as_str();

        let run = async {
            runner.run("npm", &["install"], root, &envs).await?;
            runner.run("pulumi", &["login", "--local"], root, &envs).await?;
            if let Err(select_err) = runner
                .run("pulumi", &["stack", "select", stack], root, &envs)
                .await
            {
                info!("Stack {} not selectable ({:#}), initializing it", stack, select_err);
                runner.run("pulumi", &["stack", "init", stack], root, &envs).await?;
            }
            runner.run("pulumi", &["preview", "--json"], root, &envs).await
        };

        run.await.map_err(|cause| EstimateError::PreviewGeneration {
            iac_type: IacType::Pulumi,
            root: root.to_path_buf(),
            cause,
        })
    }
}

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\r?\n?```$").unwrap()
});

/// Removes a surrounding Markdown code fence. Unfenced text is only trimmed,
/// so applying this twice changes nothing.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    match CODE_FENCE.captures(trimmed) {
        Some(caps) => caps
            .get(1)
            .map_or("", |m| m.as_str())
            .trim()
            .to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records invocations and answers from a script keyed by "program arg0 arg1".
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        failures: Vec<String>,
        show_output: Option<String>,
    }

    impl ScriptedRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str], cwd: &Path, envs: &[(&str, &str)]) -> Result<String> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().unwrap().push(line.clone());

            if program == "pulumi" {
                assert_eq!(envs, &[("PULUMI_CONFIG_PASSPHRASE", "dummy-passphrase")]);
            }
            if self.failures.iter().any(|f| line.starts_with(f.as_str())) {
                anyhow::bail!("`{}` failed", line);
            }
            if line.starts_with("terraform plan") {
                std::fs::write(cwd.join(TERRAFORM_PLAN_FILE), b"binary plan")?;
            }
            if line.starts_with("terraform show") {
                return Ok(self.show_output.clone().unwrap_or_else(|| "{\"planned_values\":{}}".to_string()));
            }
            if line.starts_with("pulumi preview") {
                return Ok("{\"steps\":[]}".to_string());
            }
            Ok(String::new())
        }
    }

    struct NoChanges;

    #[async_trait]
    impl ChangedFilesProvider for NoChanges {
        async fn list_changed_files(&self, _base_ref: &str) -> Result<Vec<String>> {
            Ok(vec!["docs/index.md".to_string()])
        }
    }

    struct CountingBackend {
        calls: AtomicUsize,
        answer: String,
    }

    #[async_trait]
    impl LlmBackend for CountingBackend {
        async fn get_response(&self, content: &str, iac_type: &str) -> Result<String, EstimateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!content.is_empty());
            assert!(iac_type == "terraform" || iac_type == "pulumi");
            Ok(self.answer.clone())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn context(runner: Arc<ScriptedRunner>) -> EstimatorContext {
        EstimatorContext {
            changes: Arc::new(NoChanges),
            runner,
            discovery: DiscoveryOptions::default(),
        }
    }

    #[tokio::test]
    async fn terraform_preview_runs_plan_pipeline_and_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let estimator = TerraformEstimator::new(context(runner.clone()));

        let preview = estimator.generate_preview(dir.path()).await.unwrap();

        assert_eq!(preview, "{\"planned_values\":{}}");
        assert_eq!(
            runner.calls(),
            vec![
                "terraform init -input=false",
                "terraform plan -input=false -out=tfplan",
                "terraform show -json tfplan",
            ]
        );
        assert!(!dir.path().join(TERRAFORM_PLAN_FILE).exists());
    }

    #[tokio::test]
    async fn terraform_artifact_removed_even_when_show_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner {
            failures: vec!["terraform show".to_string()],
            ..Default::default()
        });
        let estimator = TerraformEstimator::new(context(runner));

        let err = estimator.generate_preview(dir.path()).await.unwrap_err();

        assert!(matches!(err, EstimateError::PreviewGeneration { .. }));
        assert!(err.to_string().contains(&dir.path().display().to_string()));
        assert!(!dir.path().join(TERRAFORM_PLAN_FILE).exists());
    }

    #[tokio::test]
    async fn pulumi_initializes_stack_when_select_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner {
            failures: vec!["pulumi stack select".to_string()],
            ..Default::default()
        });
        let estimator = PulumiEstimator::new(context(runner.clone()), PulumiSettings::default());

        let preview = estimator.generate_preview(dir.path()).await.unwrap();

        assert_eq!(preview, "{\"steps\":[]}");
        assert_eq!(
            runner.calls(),
            vec![
                "npm install",
                "pulumi login --local",
                "pulumi stack select dev",
                "pulumi stack init dev",
                "pulumi preview --json",
            ]
        );
    }

    #[tokio::test]
    async fn pulumi_failure_names_root() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner {
            failures: vec!["npm install".to_string()],
            ..Default::default()
        });
        let estimator = PulumiEstimator::new(context(runner.clone()), PulumiSettings::default());

        let err = estimator.generate_preview(dir.path()).await.unwrap_err();

        assert!(matches!(err, EstimateError::PreviewGeneration { iac_type: IacType::Pulumi, .. }));
        assert_eq!(runner.calls(), vec!["npm install"]);
    }

    #[tokio::test]
    async fn analyze_without_directories_never_calls_backend() {
        let runner = Arc::new(ScriptedRunner::default());
        let estimator = TerraformEstimator::new(context(runner.clone()));
        let backend = CountingBackend {
            calls: AtomicUsize::new(0),
            answer: "{}".to_string(),
        };

        let err = estimator.analyze(None, &backend).await.unwrap_err();

        assert!(matches!(err, EstimateError::NoDirectoriesFound(IacType::Terraform)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn analyze_explicit_root_strips_fences() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let estimator = TerraformEstimator::new(context(runner));
        let backend = CountingBackend {
            calls: AtomicUsize::new(0),
            answer: "```json\n{\"resources\":[]}\n```".to_string(),
        };

        let answer = estimator.analyze(Some(dir.path()), &backend).await.unwrap();

        assert_eq!(answer, "{\"resources\":[]}");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn analyze_wraps_preview_failures() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner {
            failures: vec!["terraform init".to_string()],
            ..Default::default()
        });
        let estimator = TerraformEstimator::new(context(runner));
        let backend = CountingBackend {
            calls: AtomicUsize::new(0),
            answer: "{}".to_string(),
        };

        let err = estimator.analyze(Some(dir.path()), &backend).await.unwrap_err();

        match err {
            EstimateError::AnalysisFailed(inner) => {
                assert!(matches!(*inner, EstimateError::PreviewGeneration { .. }))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn strips_json_and_bare_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```\n"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```JSON\r\n{}\r\n```  "), "{}");
    }

    #[test]
    fn stripping_is_idempotent() {
        let unfenced = "{\"resources\":[{\"notes\":[\"uses ``` inside\"]}]}";
        assert_eq!(strip_code_fences(unfenced), unfenced);

        let once = strip_code_fences("```json\n{\"a\":1}\n```");
        assert_eq!(strip_code_fences(&once), once);
    }
}
