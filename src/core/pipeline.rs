use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::core::backend::LlmBackend;
use crate::core::error::EstimateError;
use crate::core::estimator::Estimator;
use crate::core::report::{CostAggregator, CostReport};

/// Analysis of one root. `analysis` is `None` when that root failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RootOutcome {
    pub root: PathBuf,
    pub analysis: Option<String>,
}

/// Analyzes every root concurrently. A failing root is logged and left
/// without an analysis; outcomes keep the order of `roots`.
pub async fn analyze_roots(
    estimator: Arc<dyn Estimator>,
    backend: Arc<dyn LlmBackend>,
    roots: Vec<PathBuf>,
) -> Vec<RootOutcome> {
    let mut tasks = JoinSet::new();
    for (index, root) in roots.iter().cloned().enumerate() {
        let estimator = Arc::clone(&estimator);
        let backend = Arc::clone(&backend);
        tasks.spawn(async move {
            let result = estimator.analyze_root(&root, backend.as_ref()).await;
            (index, result)
        });
    }

    let mut outcomes: Vec<RootOutcome> = roots
        .into_iter()
        .map(|root| RootOutcome { root, analysis: None })
        .collect();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(analysis))) => outcomes[index].analysis = Some(analysis),
            Ok((index, Err(err))) => {
                warn!("Skipping {}: {}", outcomes[index].root.display(), err);
            }
            Err(err) => warn!("Analysis task did not complete: {}", err),
        }
    }

    outcomes
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Analyze exactly this root and skip discovery.
    pub explicit_root: Option<PathBuf>,
    /// Analyze every discovered root instead of the first one.
    pub all_roots: bool,
}

pub struct EstimationPipeline {
    estimator: Arc<dyn Estimator>,
    backend: Arc<dyn LlmBackend>,
}

impl EstimationPipeline {
    pub fn new(estimator: Arc<dyn Estimator>, backend: Arc<dyn LlmBackend>) -> Self {
        Self { estimator, backend }
    }

    pub async fn run(&self, options: &PipelineOptions) -> Result<CostReport, EstimateError> {
        let iac_type = self.estimator.iac_type();
        info!(
            "Estimating {} changes with the {} backend",
            iac_type.display_name(),
            self.backend.name()
        );

        let report = match (&options.explicit_root, options.all_roots) {
            (None, true) => {
                let roots = self.estimator.find_directories().await?;
                if roots.is_empty() {
                    return Err(EstimateError::NoDirectoriesFound(iac_type));
                }
                info!("Analyzing {} root(s)", roots.len());
                let outcomes =
                    analyze_roots(Arc::clone(&self.estimator), Arc::clone(&self.backend), roots).await;

                // Skipped indices refer to positions in discovery order
                let report = CostAggregator::aggregate_indexed(
                    outcomes
                        .iter()
                        .enumerate()
                        .filter_map(|(index, outcome)| outcome.analysis.as_deref().map(|a| (index, a))),
                );
                for &index in &report.skipped_analyses {
                    warn!("Unusable answer for {}", outcomes[index].root.display());
                }
                report
            }
            (explicit_root, _) => {
                let analysis = self
                    .estimator
                    .analyze(explicit_root.as_deref(), self.backend.as_ref())
                    .await?;
                CostAggregator::aggregate(&[analysis])
            }
        };

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::iac::IacType;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeEstimator {
        roots: Vec<PathBuf>,
        failing: Vec<PathBuf>,
        slow: Option<PathBuf>,
    }

    impl FakeEstimator {
        fn with_roots(roots: &[&str]) -> Self {
            Self {
                roots: roots.iter().map(PathBuf::from).collect(),
                failing: Vec::new(),
                slow: None,
            }
        }
    }

    #[async_trait]
    impl Estimator for FakeEstimator {
        fn iac_type(&self) -> IacType {
            IacType::Terraform
        }

        async fn find_directories(&self) -> Result<Vec<PathBuf>, EstimateError> {
            Ok(self.roots.clone())
        }

        async fn generate_preview(&self, root: &Path) -> Result<String, EstimateError> {
            if self.slow.as_deref() == Some(root) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if self.failing.iter().any(|failing| failing == root) {
                return Err(EstimateError::PreviewGeneration {
                    iac_type: IacType::Terraform,
                    root: root.to_path_buf(),
                    cause: anyhow::anyhow!("plan exited with 1"),
                });
            }
            Ok(root.display().to_string())
        }
    }

    /// Prices every root at 10 and names the resource after the preview.
    /// Previews listed in `prose_for` get a non-JSON answer.
    #[derive(Default)]
    struct FlatRateBackend {
        calls: AtomicUsize,
        prose_for: Vec<String>,
    }

    #[async_trait]
    impl LlmBackend for FlatRateBackend {
        async fn get_response(&self, content: &str, _iac_type: &str) -> Result<String, EstimateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.prose_for.iter().any(|p| p == content) {
                return Ok("not json".to_string());
            }
            Ok(format!(
                "```json\n{{\"resources\":[{{\"resource_name\":\"{}\",\"base_cost\":10,\"high_usage_cost\":1}}]}}\n```",
                content
            ))
        }

        fn name(&self) -> &str {
            "flat-rate"
        }
    }

    #[tokio::test]
    async fn failing_root_is_skipped_and_order_is_kept() {
        let mut estimator = FakeEstimator::with_roots(&["net", "db", "app"]);
        estimator.failing = vec![PathBuf::from("db")];
        estimator.slow = Some(PathBuf::from("net"));
        let backend = Arc::new(FlatRateBackend::default());

        let outcomes = analyze_roots(Arc::new(estimator), backend.clone(), vec![
            PathBuf::from("net"),
            PathBuf::from("db"),
            PathBuf::from("app"),
        ])
        .await;

        let roots: Vec<_> = outcomes.iter().map(|o| o.root.to_str().unwrap()).collect();
        assert_eq!(roots, vec!["net", "db", "app"]);
        assert!(outcomes[0].analysis.as_deref().unwrap().contains("\"net\""));
        assert_eq!(outcomes[1].analysis, None);
        assert!(outcomes[2].analysis.is_some());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_roots_report_sums_surviving_roots() {
        let mut estimator = FakeEstimator::with_roots(&["net", "db", "app"]);
        estimator.failing = vec![PathBuf::from("app")];
        let pipeline = EstimationPipeline::new(Arc::new(estimator), Arc::new(FlatRateBackend::default()));

        let report = pipeline
            .run(&PipelineOptions {
                explicit_root: None,
                all_roots: true,
            })
            .await
            .unwrap();

        assert_eq!(report.total_base_cost, 20.0);
        assert_eq!(report.variable_costs.high, 2.0);
        let services: Vec<_> = report.detailed_costs.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(services, vec!["net", "db"]);
    }

    #[tokio::test]
    async fn no_directories_fails_without_backend_calls() {
        for all_roots in [true, false] {
            let backend = Arc::new(FlatRateBackend::default());
            let pipeline = EstimationPipeline::new(
                Arc::new(FakeEstimator::with_roots(&[])),
                backend.clone(),
            );

            let err = pipeline
                .run(&PipelineOptions {
                    explicit_root: None,
                    all_roots,
                })
                .await
                .unwrap_err();

            assert!(matches!(err, EstimateError::NoDirectoriesFound(IacType::Terraform)));
            assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn explicit_root_skips_discovery() {
        let backend = Arc::new(FlatRateBackend::default());
        let pipeline = EstimationPipeline::new(
            Arc::new(FakeEstimator::with_roots(&["ignored-a", "ignored-b"])),
            backend.clone(),
        );

        let report = pipeline
            .run(&PipelineOptions {
                explicit_root: Some(PathBuf::from("infra/prod")),
                all_roots: true,
            })
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.detailed_costs[0].service, "infra/prod");
        assert_eq!(report.analyses_parsed, 1);
    }

    #[tokio::test]
    async fn single_root_mode_uses_first_discovered_root() {
        let backend = Arc::new(FlatRateBackend::default());
        let pipeline = EstimationPipeline::new(
            Arc::new(FakeEstimator::with_roots(&["first", "second"])),
            backend.clone(),
        );

        let report = pipeline.run(&PipelineOptions::default()).await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.detailed_costs[0].service, "first");
    }

    #[tokio::test]
    async fn skipped_answer_is_reported_by_its_root() {
        let mut estimator = FakeEstimator::with_roots(&["net", "db", "app"]);
        estimator.failing = vec![PathBuf::from("db")];
        let backend = FlatRateBackend {
            prose_for: vec!["app".to_string()],
            ..Default::default()
        };
        let pipeline = EstimationPipeline::new(Arc::new(estimator), Arc::new(backend));

        let report = pipeline
            .run(&PipelineOptions {
                explicit_root: None,
                all_roots: true,
            })
            .await
            .unwrap();

        let roots = ["net", "db", "app"];
        let skipped: Vec<_> = report.skipped_analyses.iter().map(|&i| roots[i]).collect();
        assert_eq!(skipped, vec!["app"]);
        assert_eq!(report.analyses_parsed, 1);
        assert_eq!(report.total_base_cost, 10.0);
    }
}
