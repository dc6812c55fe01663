// ABOUTME: Configuration file support for switchboard.
// ABOUTME: Loads backend configs from TOML with one [backends.<name>] table per backend.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Backend configuration with type discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type: "stdio", "http-sse", "mock"
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Remaining fields passed to the backend factory
    #[serde(flatten)]
    pub config: toml::Table,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    /// Config file locations, most specific first:
    /// `explicit`, ./switchboard.toml, ~/.config/switchboard/config.toml
    pub fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = explicit {
            candidates.push(path.to_path_buf());
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join("switchboard.toml"));
        }
        if let Some(config_dir) = user_config_dir() {
            candidates.push(config_dir.join("switchboard/config.toml"));
        }
        candidates
    }

    /// Load the first config file that exists.
    ///
    /// An explicit path that does not exist is an error rather than a fallthrough.
    pub fn find_and_load(explicit: Option<&Path>) -> Result<Option<(PathBuf, Self)>> {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
        }

        for candidate in Self::candidates(explicit) {
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "Found config file");
                let config = Self::from_file(&candidate)?;
                return Ok(Some((candidate, config)));
            }
        }

        Ok(None)
    }

    /// Look up one backend table by name
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }
}

impl BackendConfig {
    /// Get backend type name
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    /// Convert config table to serde_json::Value for the registry
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Backend config is not representable as JSON");
            serde_json::json!({})
        })
    }
}

/// Get user config directory
fn user_config_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config"))
}
