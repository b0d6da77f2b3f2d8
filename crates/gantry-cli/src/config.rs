//! CLI configuration management.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Where workflow files are discovered.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,
    /// Parent directory of per-run workspaces; the system temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub keep_workspaces: bool,
    /// Repository cloned by the `checkout` action; the current repository when unset.
    #[serde(default)]
    pub repository: Option<String>,
    /// Default endpoint for the `upload-coverage` action.
    #[serde(default)]
    pub coverage_url: Option<String>,
    /// Output format.
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            workspace_root: None,
            keep_workspaces: false,
            repository: None,
            coverage_url: None,
            output_format: OutputFormat::default(),
        }
    }
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from(".gantry/workflows")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid configuration in {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "gantry", "gantry")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());
        match key {
            "workflows_dir" => self.workflows_dir = PathBuf::from(value),
            "workspace_root" => self.workspace_root = optional(value).map(PathBuf::from),
            "keep_workspaces" => {
                self.keep_workspaces = value
                    .parse()
                    .map_err(|_| format!("Expected true or false, got: {}", value))?;
            }
            "repository" => self.repository = optional(value),
            "coverage_url" => self.coverage_url = optional(value),
            "output_format" => {
                self.output_format = match value {
                    "text" => OutputFormat::Text,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => return Err(format!("Invalid output format: {}", value)),
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }

    /// Variables exported to every run.
    pub fn base_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(repository) = &self.repository {
            env.insert("GANTRY_REPOSITORY".to_string(), repository.clone());
        }
        if let Some(url) = &self.coverage_url {
            env.insert("GANTRY_COVERAGE_URL".to_string(), url.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_known_keys() {
        let mut config = CliConfig::default();
        config.set("keep_workspaces", "true").unwrap();
        config.set("coverage_url", "https://cov.example.com/upload").unwrap();
        config.set("output_format", "json").unwrap();
        config.set("workspace_root", "/var/tmp/gantry").unwrap();

        assert!(config.keep_workspaces);
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.workspace_root, Some(PathBuf::from("/var/tmp/gantry")));
        assert_eq!(
            config.base_env().get("GANTRY_COVERAGE_URL").map(String::as_str),
            Some("https://cov.example.com/upload")
        );
    }

    #[test]
    fn test_empty_value_clears_optional() {
        let mut config = CliConfig::default();
        config.set("repository", "/srv/repo").unwrap();
        config.set("repository", "").unwrap();
        assert_eq!(config.repository, None);
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let mut config = CliConfig::default();
        assert!(config.set("api_url", "x").is_err());
        assert!(config.set("keep_workspaces", "maybe").is_err());
        assert!(config.set("output_format", "xml").is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: CliConfig = serde_yaml::from_str("keep_workspaces: true\n").unwrap();
        assert!(config.keep_workspaces);
        assert_eq!(config.workflows_dir, PathBuf::from(".gantry/workflows"));
        assert_eq!(config.output_format, OutputFormat::Text);
    }
}
