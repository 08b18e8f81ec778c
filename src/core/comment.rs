use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Publishes a markdown body on an issue or pull request.
#[async_trait]
pub trait CommentPoster: Send + Sync {
    async fn post_comment(&self, owner: &str, repo: &str, issue_number: u64, body: &str) -> Result<()>;
}

pub struct GitHubCommentPoster {
    client: Client,
    api_url: String,
    token: String,
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

impl GitHubCommentPoster {
    pub fn new(token: impl Into<String>, api_url: Option<String>) -> Result<Self> {
        let api_url = api_url
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .user_agent(concat!("costscope/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_url,
            token: token.into(),
        })
    }

    /// Token from `GITHUB_TOKEN`.
    pub fn from_env(api_url: Option<String>) -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN must be set to post comments")?;
        Self::new(token, api_url)
    }
}

#[async_trait]
impl CommentPoster for GitHubCommentPoster {
    async fn post_comment(&self, owner: &str, repo: &str, issue_number: u64, body: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_url, owner, repo, issue_number
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&CommentBody { body })
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error ({}): {}", status, error_text);
        }

        info!("Posted cost estimate to {}/{}#{}", owner, repo, issue_number);
        Ok(())
    }
}
