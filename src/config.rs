//! Configuration management for craft-code
//!
//! Stores settings in ~/.config/craft-code/config.toml

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::tools::ToolLimits;

pub const DEFAULT_PROVIDER: &str = "lm_studio";

/// Env var that overrides the API key for any provider.
pub const API_KEY_ENV: &str = "CRAFT_CODE_API_KEY";

/// (name, base_url, model)
const BUILTIN_PROVIDERS: &[(&str, &str, &str)] = &[
    ("lm_studio", "http://localhost:1234/v1", "qwen/qwen3-4b-2507"),
    ("ollama", "http://localhost:11434/v1", "qwen3:4b"),
    ("openai", "https://api.openai.com/v1", "gpt-5"),
    ("mistral", "https://api.mistral.ai/v1", "mistral-small-latest"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Agent loop and tool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_turns: usize,
    /// Use SSE streaming for chat requests
    pub stream: bool,
    pub request_timeout_secs: u64,
    pub shell_timeout_secs: u64,
    pub approval_timeout_secs: u64,
    pub max_result_chars: usize,
    pub grep_max_matches: usize,
    pub find_max_results: usize,
    /// Additional regexes that make a shell command require approval
    pub extra_risk_patterns: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 25,
            stream: false,
            request_timeout_secs: 120,
            shell_timeout_secs: 120,
            approval_timeout_secs: 60,
            max_result_chars: 32_000,
            grep_max_matches: 200,
            find_max_results: 500,
            extra_risk_patterns: Vec::new(),
        }
    }
}

/// Smallest result budget honoured, whatever the file says.
pub const MIN_RESULT_CHARS: usize = 4096;

/// Room kept for the read footer and status prefix inside the result budget.
const READ_FOOTER_RESERVE: usize = 1024;

impl AgentSettings {
    pub fn max_result_chars(&self) -> usize {
        self.max_result_chars.max(MIN_RESULT_CHARS)
    }

    /// Tool limits for these settings. A read page is sized so the page and
    /// its footer fit the result budget, since each byte is at most one char.
    pub fn tool_limits(&self) -> ToolLimits {
        let defaults = ToolLimits::default();
        let read_budget = (self.max_result_chars() - READ_FOOTER_RESERVE) as u64;
        ToolLimits {
            read_max_bytes: defaults.read_max_bytes.min(read_budget),
            shell_timeout: Duration::from_secs(self.shell_timeout_secs.max(1))
                .min(defaults.shell_max_timeout),
            grep_max_matches: self.grep_max_matches.max(1),
            find_max_results: self.find_max_results.max(1),
            ..defaults
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    /// Name of the active entry in `models`
    pub provider: String,
    pub models: BTreeMap<String, ProviderConfig>,
    pub agent: AgentSettings,
}

/// On-disk shape: every field optional so partial files merge over defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    provider: Option<String>,
    #[serde(default)]
    models: BTreeMap<String, PartialProvider>,
    #[serde(default)]
    agent: AgentSettings,
}

#[derive(Debug, Default, Deserialize)]
struct PartialProvider {
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
}

/// The provider a session talks to, with its API key resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let models = BUILTIN_PROVIDERS
            .iter()
            .map(|(name, base_url, model)| {
                (
                    name.to_string(),
                    ProviderConfig {
                        base_url: base_url.to_string(),
                        model: model.to_string(),
                        api_key: None,
                    },
                )
            })
            .collect();
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            models,
            agent: AgentSettings::default(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("craft-code"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load `path`, merging it over the defaults. A file that does not parse is
    /// moved aside and the defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match Self::parse(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    "config file was corrupted ({err}); a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut config = Self::default();
        if let Some(provider) = file.provider {
            config.provider = provider;
        }
        config.agent = file.agent;

        for (name, partial) in file.models {
            match config.models.get_mut(&name) {
                Some(existing) => {
                    if let Some(base_url) = partial.base_url {
                        existing.base_url = base_url;
                    }
                    if let Some(model) = partial.model {
                        existing.model = model;
                    }
                    if partial.api_key.is_some() {
                        existing.api_key = partial.api_key;
                    }
                }
                None => match (partial.base_url, partial.model) {
                    (Some(base_url), Some(model)) => {
                        config.models.insert(
                            name,
                            ProviderConfig {
                                base_url,
                                model,
                                api_key: partial.api_key,
                            },
                        );
                    }
                    _ => warn!(provider = %name, "ignoring provider without base_url and model"),
                },
            }
        }
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path().ok_or_else(|| anyhow!("could not determine config directory"))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("config path {} has no parent", path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                warn!("failed to set config directory permissions: {e}");
            }
        }

        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        write_config_atomic(path, &content)
            .with_context(|| format!("failed to write config to {}", path.display()))
    }

    /// Resolve the active provider and its API key.
    ///
    /// Key order: `CRAFT_CODE_API_KEY`, then `OPENAI_API_KEY` for the `openai`
    /// provider, then the key stored in the file.
    pub fn active_model(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<ResolvedModel> {
        let provider = self.models.get(&self.provider).ok_or_else(|| {
            anyhow!(
                "unknown provider '{}' (known: {}). Run `craft-code configure`.",
                self.provider,
                self.models.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })?;

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let api_key = non_empty(env(API_KEY_ENV))
            .or_else(|| {
                (self.provider == "openai")
                    .then(|| non_empty(env("OPENAI_API_KEY")))
                    .flatten()
            })
            .or_else(|| non_empty(provider.api_key.clone()));

        Ok(ResolvedModel {
            provider: self.provider.clone(),
            base_url: provider.base_url.clone(),
            model: provider.model.clone(),
            api_key,
        })
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/craft-code/config.toml".to_string())
    }
}

/// Local servers (LM Studio, Ollama) don't need an API key.
pub fn is_local_endpoint(base_url: &str) -> bool {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .is_some_and(|host| matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]" | "::1"))
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    staged.write_all(content.as_bytes())?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}
