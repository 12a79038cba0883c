use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const DEFAULT_USER_AGENT: &str = "wikisync/0.1";
pub const DEFAULT_WIKI_DIR: &str = "Wiki";
pub const DEFAULT_SEPARATOR: &str = " › ";
pub const DEFAULT_EXPAND_LEVEL: usize = 2;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiConfig {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub flatten: FlattenSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub space_url: Option<String>,
    pub project_key: Option<String>,
    /// Slash-delimited page name (or page URL) limiting downloads to a subtree.
    pub wiki_prefix: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LocalSection {
    pub wiki_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FlattenSection {
    pub output_dir: Option<String>,
    pub separator: Option<String>,
    pub expand_level: Option<usize>,
    pub clean: Option<bool>,
}

impl WikiConfig {
    /// Resolve the Backlog space URL: env BACKLOG_SPACE_URL > config > None.
    /// The result is normalized to scheme + host.
    pub fn space_url(&self) -> Option<String> {
        env_value("BACKLOG_SPACE_URL")
            .or_else(|| non_empty(self.remote.space_url.as_deref()))
            .map(|value| normalize_space_url(&value))
    }

    /// API keys never live in the config file.
    pub fn api_key(&self) -> Option<String> {
        env_value("BACKLOG_API_KEY")
    }

    /// Resolve the project key: env BACKLOG_PROJECT_KEY > config > None.
    pub fn project_key(&self) -> Option<String> {
        env_value("BACKLOG_PROJECT_KEY").or_else(|| non_empty(self.remote.project_key.as_deref()))
    }

    pub fn wiki_prefix(&self) -> Option<String> {
        non_empty(self.remote.wiki_prefix.as_deref())
    }

    pub fn user_agent(&self) -> String {
        non_empty(self.remote.user_agent.as_deref())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn wiki_dir(&self) -> &str {
        self.local
            .wiki_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_WIKI_DIR)
    }

    pub fn flatten_output_dir(&self) -> Option<String> {
        non_empty(self.flatten.output_dir.as_deref())
    }

    /// Separator between flattened segments. Unlike the other keys an empty
    /// string is honored here.
    pub fn separator(&self) -> &str {
        self.flatten.separator.as_deref().unwrap_or(DEFAULT_SEPARATOR)
    }

    pub fn expand_level(&self) -> usize {
        self.flatten.expand_level.unwrap_or(DEFAULT_EXPAND_LEVEL)
    }

    pub fn clean(&self) -> bool {
        self.flatten.clean.unwrap_or(false)
    }
}

/// Load and parse a WikiConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WikiConfig> {
    if !config_path.exists() {
        return Ok(WikiConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WikiConfig = toml::from_str(&content).map_err(|error| {
        SyncError::Configuration(format!("failed to parse {}: {error}", config_path.display()))
    })?;
    Ok(parsed)
}

/// Reduce any URL inside a Backlog space to `scheme://host[:port]`.
/// Input without a scheme is assumed to be https.
pub fn normalize_space_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    match Url::parse(&candidate) {
        Ok(url) => match url.host_str() {
            Some(host) => match url.port() {
                Some(port) => format!("{}://{host}:{port}", url.scheme()),
                None => format!("{}://{host}", url.scheme()),
            },
            None => candidate.trim_end_matches('/').to_string(),
        },
        Err(_) => candidate.trim_end_matches('/').to_string(),
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_empty(Some(&value)))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
