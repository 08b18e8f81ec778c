use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::adapters::llm::{create_adapter, LLMAdapter, LLMRequest, ModelConfig};
use crate::core::error::EstimateError;
use crate::core::prompt::{PromptTemplates, JSON_ONLY_INSTRUCTION};

/// Stateless prompt/response contract every model provider implements.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Asks the model about `content` using the template registered for
    /// `iac_type`. Returns the raw answer without validating it.
    async fn get_response(&self, content: &str, iac_type: &str) -> Result<String, EstimateError>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreset {
    #[default]
    #[value(name = "openai")]
    OpenAi,
    Groq,
    Custom,
}

/// Fixed endpoint, model and sampling of one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendProfile {
    pub name: String,
    pub model: String,
    pub base_url: Option<String>,
    pub system_instruction: Option<String>,
    pub temperature: f32,
    pub top_p: Option<f32>,
}

impl BackendProfile {
    pub fn openai() -> Self {
        Self {
            name: "openai".to_string(),
            model: "gpt-4o".to_string(),
            base_url: Some("https://api.openai.com/v1".to_string()),
            system_instruction: Some(JSON_ONLY_INSTRUCTION.to_string()),
            temperature: 0.2,
            top_p: Some(0.1),
        }
    }

    pub fn groq() -> Self {
        Self {
            name: "groq".to_string(),
            model: "llama3-8b-8192".to_string(),
            base_url: Some("https://api.groq.com/openai/v1".to_string()),
            ..Self::openai()
        }
    }

    pub fn custom(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: "custom".to_string(),
            model: model.into(),
            base_url: Some(base_url.into()),
            ..Self::openai()
        }
    }

    /// Resolves a preset plus optional overrides. A custom backend needs both
    /// a model and a base URL.
    pub fn resolve(
        preset: BackendPreset,
        model: Option<&str>,
        base_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut profile = match preset {
            BackendPreset::OpenAi => Self::openai(),
            BackendPreset::Groq => Self::groq(),
            BackendPreset::Custom => {
                let (Some(model), Some(base_url)) = (model, base_url) else {
                    anyhow::bail!("The custom backend requires both a model and a base URL");
                };
                return Ok(Self::custom(model, base_url));
            }
        };

        if let Some(model) = model {
            profile.model = model.to_string();
            // Non-OpenAI model families pick their own transport default
            if model.starts_with("claude") || model.starts_with("ollama:") {
                profile.base_url = None;
            }
        }
        if let Some(base_url) = base_url {
            profile.base_url = Some(base_url.to_string());
        }
        Ok(profile)
    }
}

/// The one backend implementation: a transport adapter, a profile and the
/// shared templates.
pub struct ChatBackend {
    adapter: Box<dyn LLMAdapter>,
    profile: BackendProfile,
    templates: Arc<PromptTemplates>,
}

impl ChatBackend {
    pub fn new(
        profile: BackendProfile,
        api_key: Option<String>,
        max_tokens: usize,
        templates: Arc<PromptTemplates>,
    ) -> anyhow::Result<Self> {
        let model_config = ModelConfig {
            model_name: profile.model.clone(),
            api_key,
            base_url: profile.base_url.clone(),
            temperature: profile.temperature,
            top_p: profile.top_p,
            max_tokens,
        };
        let adapter = create_adapter(&model_config)?;
        Ok(Self::with_adapter(adapter, profile, templates))
    }

    pub fn with_adapter(
        adapter: Box<dyn LLMAdapter>,
        profile: BackendProfile,
        templates: Arc<PromptTemplates>,
    ) -> Self {
        Self {
            adapter,
            profile,
            templates,
        }
    }
}

#[async_trait]
impl LlmBackend for ChatBackend {
    async fn get_response(&self, content: &str, iac_type: &str) -> Result<String, EstimateError> {
        let template = self.templates.get(iac_type)?;

        let request = LLMRequest {
            system_prompt: self.profile.system_instruction.clone(),
            user_prompt: template.render(content),
            temperature: Some(self.profile.temperature),
            top_p: self.profile.top_p,
            max_tokens: None,
        };

        info!(
            "Requesting {} cost analysis from {} ({})",
            iac_type,
            self.profile.name,
            self.adapter.model_name()
        );
        let response = self
            .adapter
            .complete(request)
            .await
            .map_err(|e| EstimateError::BackendRequest {
                provider: self.profile.name.clone(),
                message: format!("{:#}", e),
            })?;

        if let Some(usage) = &response.usage {
            debug!(
                "{} used {} prompt + {} completion tokens",
                response.model, usage.prompt_tokens, usage.completion_tokens
            );
        }
        Ok(response.content)
    }

    fn name(&self) -> &str {
        &self.profile.name
    }
}
