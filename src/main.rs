mod adapters;
mod config;
mod core;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::core::{
    create_estimator, render_markdown, BackendPreset, BackendProfile, ChatBackend, CommentPoster,
    CostAggregator, CostReport, EstimationPipeline, Estimator, EstimatorContext, GitHubCommentPoster,
    GitIntegration, IacType, PipelineOptions, ProcessRunner, PromptTemplates,
};

#[derive(Parser)]
#[command(name = "costscope")]
#[command(about = "Estimate the monthly cloud cost impact of Terraform and Pulumi changes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, value_enum)]
    provider: Option<BackendPreset>,

    #[arg(long, global = true)]
    model: Option<String>,

    #[arg(long, global = true, help = "OpenAI-compatible endpoint for the model")]
    base_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "markdown")]
    output_format: OutputFormat,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Preview changed IaC roots and estimate their cost")]
    Estimate {
        #[command(flatten)]
        source: SourceArgs,

        #[arg(long, help = "Analyze this directory instead of discovering changed roots")]
        dir: Option<PathBuf>,

        #[arg(long, help = "Analyze only the first discovered root")]
        first_root_only: bool,

        #[arg(long, value_name = "FILE", help = "Earlier JSON report to compute deltas against")]
        baseline: Option<PathBuf>,

        #[arg(short, long, help = "Output file path (prints to stdout if not provided)")]
        output: Option<PathBuf>,

        #[command(flatten)]
        post: PostArgs,
    },
    #[command(about = "List the IaC roots touched since the base ref")]
    Discover {
        #[command(flatten)]
        source: SourceArgs,
    },
    #[command(about = "Aggregate saved model answers into a report")]
    Report {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, value_name = "FILE", help = "Earlier JSON report to compute deltas against")]
        baseline: Option<PathBuf>,

        #[arg(short, long, help = "Output file path (prints to stdout if not provided)")]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long, help = "IaC tool: terraform or pulumi")]
    stack: Option<String>,

    #[arg(long, help = "Base ref to diff against")]
    base_ref: Option<String>,

    #[arg(long, help = "Do not fetch the base ref before diffing")]
    no_fetch: bool,
}

#[derive(Args)]
struct PostArgs {
    #[arg(long, requires_all = ["repo", "pr"], help = "Post the markdown report as a PR comment")]
    post: bool,

    #[arg(long, value_name = "OWNER/NAME")]
    repo: Option<String>,

    #[arg(long)]
    pr: Option<u64>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match config::Config::load() {
        Ok(config) => config,
        Err(err) => {
            warn!("Ignoring config file: {:#}", err);
            config::Config::default()
        }
    };
    config.apply_env()?;
    config.merge_with_cli(cli.provider, cli.model.clone(), cli.base_url.clone());

    match cli.command {
        Commands::Estimate {
            source,
            dir,
            first_root_only,
            baseline,
            output,
            post,
        } => {
            estimate_command(
                config,
                source,
                dir,
                first_root_only,
                baseline,
                output,
                post,
                cli.output_format,
            )
            .await?;
        }
        Commands::Discover { source } => {
            discover_command(config, source, cli.output_format).await?;
        }
        Commands::Report {
            files,
            baseline,
            output,
        } => {
            report_command(files, baseline, output, cli.output_format)?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn estimate_command(
    mut config: config::Config,
    source: SourceArgs,
    dir: Option<PathBuf>,
    first_root_only: bool,
    baseline: Option<PathBuf>,
    output: Option<PathBuf>,
    post: PostArgs,
    format: OutputFormat,
) -> Result<()> {
    // Reject unknown stacks before touching git, the IaC tool or the model
    let iac_type = resolve_stack(&config, &source)?;
    let baseline = baseline.as_deref().map(load_baseline).transpose()?;
    let poster = if post.post {
        Some(GitHubCommentPoster::from_env(config.github_api_url.clone())?)
    } else {
        None
    };

    let profile = BackendProfile::resolve(
        config.provider,
        config.model.as_deref(),
        config.base_url.as_deref(),
    )?;
    let templates = Arc::new(PromptTemplates::standard());
    let backend = ChatBackend::new(profile, config.api_key.clone(), config.max_tokens, templates)?;

    let estimator = build_estimator(&mut config, &source, iac_type);
    let pipeline = EstimationPipeline::new(estimator, Arc::new(backend));
    let options = PipelineOptions {
        explicit_root: dir.or_else(|| config.iac_dir.clone()),
        all_roots: config.all_roots && !first_root_only,
    };

    let mut report = pipeline.run(&options).await?;
    if let Some(baseline) = &baseline {
        report.apply_baseline(baseline);
    }

    write_output(&render(&report, format)?, output.as_deref())?;

    if let Some(poster) = poster {
        let (owner, repo) = split_repo(post.repo.as_deref().unwrap_or_default())?;
        let number = post.pr.context("--pr is required with --post")?;
        poster
            .post_comment(owner, repo, number, &render_markdown(&report))
            .await?;
    }

    Ok(())
}

async fn discover_command(
    mut config: config::Config,
    source: SourceArgs,
    format: OutputFormat,
) -> Result<()> {
    let iac_type = resolve_stack(&config, &source)?;
    let estimator = build_estimator(&mut config, &source, iac_type);
    let roots = estimator.find_directories().await?;

    let output = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&roots)?,
        OutputFormat::Markdown => roots
            .iter()
            .map(|root| format!("- {}", root.display()))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    write_output(&output, None)
}

fn report_command(
    files: Vec<PathBuf>,
    baseline: Option<PathBuf>,
    output: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let analyses = files
        .iter()
        .map(|path| {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut report = CostAggregator::aggregate(&analyses);
    if let Some(path) = baseline {
        report.apply_baseline(&load_baseline(&path)?);
    }
    info!(
        "Aggregated {} of {} analyses",
        report.analyses_parsed,
        analyses.len()
    );

    write_output(&render(&report, format)?, output.as_deref())
}

fn resolve_stack(config: &config::Config, source: &SourceArgs) -> Result<IacType> {
    let stack = source.stack.as_deref().unwrap_or(&config.iac_stack);
    Ok(stack.parse::<IacType>()?)
}

fn build_estimator(
    config: &mut config::Config,
    source: &SourceArgs,
    iac_type: IacType,
) -> Arc<dyn Estimator> {
    if let Some(base_ref) = &source.base_ref {
        config.base_ref = base_ref.clone();
    }
    let git = GitIntegration::new(".").with_fetch(config.fetch_base && !source.no_fetch);
    let context = EstimatorContext {
        changes: Arc::new(git),
        runner: Arc::new(ProcessRunner::new()),
        discovery: config.discovery_options(),
    };
    create_estimator(iac_type, context, config.pulumi_settings())
}

fn load_baseline(path: &Path) -> Result<CostReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read baseline {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid baseline report in {}", path.display()))
}

fn render(report: &CostReport, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Markdown => render_markdown(report),
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
    })
}

fn write_output(content: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn split_repo(repo: &str) -> Result<(&str, &str)> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok((owner, name)),
        _ => anyhow::bail!("Expected --repo in OWNER/NAME form, got '{}'", repo),
    }
}
