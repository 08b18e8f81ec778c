use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::backend::BackendPreset;
use crate::core::discovery::DiscoveryOptions;
use crate::core::estimator::PulumiSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_iac_stack")]
    pub iac_stack: String,

    /// Analyze this directory instead of discovering changed roots.
    pub iac_dir: Option<PathBuf>,

    #[serde(default = "default_base_ref")]
    pub base_ref: String,

    #[serde(default = "default_true")]
    pub fetch_base: bool,

    #[serde(default = "default_true")]
    pub all_roots: bool,

    #[serde(default)]
    pub exclude_paths: Vec<String>,

    #[serde(default)]
    pub provider: BackendPreset,

    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_pulumi_stack")]
    pub pulumi_stack: String,

    #[serde(default = "default_pulumi_passphrase")]
    pub pulumi_passphrase: String,

    pub github_api_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iac_stack: default_iac_stack(),
            iac_dir: None,
            base_ref: default_base_ref(),
            fetch_base: true,
            all_roots: true,
            exclude_paths: Vec::new(),
            provider: BackendPreset::default(),
            model: None,
            base_url: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            pulumi_stack: default_pulumi_stack(),
            pulumi_passphrase: default_pulumi_passphrase(),
            github_api_url: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut candidates = vec![PathBuf::from(".costscope.yml"), PathBuf::from(".costscope.yaml")];
        if let Some(home_dir) = dirs::home_dir() {
            candidates.push(home_dir.join(".costscope.yml"));
        }

        for path in candidates {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Config::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies the CI environment variables. Empty values are ignored.
    /// Provider API keys stay in the environment; each adapter reads its own.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(stack) = get("IAC_STACK") {
            self.iac_stack = stack;
        }
        if let Some(dir) = get("IAC_DIR") {
            self.iac_dir = Some(PathBuf::from(dir));
        }
        if let Some(base_ref) = get("GITHUB_BASE_REF") {
            self.base_ref = base_ref;
        }
        if let Some(provider) = get("LLM_PROVIDER") {
            self.provider = <BackendPreset as clap::ValueEnum>::from_str(provider.trim(), true)
                .map_err(|_| anyhow::anyhow!("Unknown LLM_PROVIDER '{}'", provider))?;
        }
        if let Some(model) = get("MODEL") {
            self.model = Some(model);
        }
        if let Some(base_url) = get("MODEL_BASE_URL") {
            self.base_url = Some(base_url);
        }
        Ok(())
    }

    pub fn merge_with_cli(
        &mut self,
        provider: Option<BackendPreset>,
        model: Option<String>,
        base_url: Option<String>,
    ) {
        if let Some(provider) = provider {
            self.provider = provider;
        }
        if let Some(model) = model {
            self.model = Some(model);
        }
        if let Some(base_url) = base_url {
            self.base_url = Some(base_url);
        }
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            base_ref: self.base_ref.clone(),
            exclude_paths: self.exclude_paths.clone(),
        }
    }

    pub fn pulumi_settings(&self) -> PulumiSettings {
        PulumiSettings {
            stack: self.pulumi_stack.clone(),
            passphrase: self.pulumi_passphrase.clone(),
        }
    }
}

fn default_iac_stack() -> String {
    "terraform".to_string()
}

fn default_base_ref() -> String {
    "main".to_string()
}

fn default_max_tokens() -> usize {
    4000
}

fn default_pulumi_stack() -> String {
    "dev".to_string()
}

fn default_pulumi_passphrase() -> String {
    "dummy-passphrase".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".costscope.yml");
        std::fs::write(
            &path,
            "iac_stack: pulumi\nprovider: groq\nexclude_paths:\n  - \"modules/**\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.iac_stack, "pulumi");
        assert_eq!(config.provider, BackendPreset::Groq);
        assert_eq!(config.exclude_paths, vec!["modules/**"]);
        assert_eq!(config.base_ref, "main");
        assert!(config.all_roots);
        assert!(config.fetch_base);
        assert_eq!(config.max_tokens, 4000);
        assert_eq!(config.pulumi_settings().stack, "dev");
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("IAC_STACK", "Pulumi"),
            ("IAC_DIR", "infra/prod"),
            ("GITHUB_BASE_REF", "release"),
            ("LLM_PROVIDER", "custom"),
            ("MODEL", "mixtral"),
            ("MODEL_BASE_URL", "http://llm.internal/v1"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("IGNORED", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.iac_stack, "Pulumi");
        assert_eq!(config.iac_dir, Some(PathBuf::from("infra/prod")));
        assert_eq!(config.discovery_options().base_ref, "release");
        assert_eq!(config.provider, BackendPreset::Custom);
        assert_eq!(config.model.as_deref(), Some("mixtral"));
        assert_eq!(config.base_url.as_deref(), Some("http://llm.internal/v1"));
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn empty_env_values_and_bad_provider() {
        let mut config = Config::default();
        config
            .apply_env_from(|key| (key == "IAC_DIR").then(|| "  ".to_string()))
            .unwrap();
        assert_eq!(config.iac_dir, None);

        let err = config
            .apply_env_from(|key| (key == "LLM_PROVIDER").then(|| "bedrock".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("bedrock"));
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = Config::default();
        config.merge_with_cli(Some(BackendPreset::Groq), Some("llama3-70b-8192".to_string()), None);
        assert_eq!(config.provider, BackendPreset::Groq);
        assert_eq!(config.model.as_deref(), Some("llama3-70b-8192"));
        assert_eq!(config.base_url, None);
    }
}
