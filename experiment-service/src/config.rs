// Engine Configuration
// YAML engine settings and experiment definition files

use crate::models::{ContextMode, ExperimentConfig, Hyperparameters, RetrievalSettings};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Overrides `inference.base_url`
pub const OLLAMA_URL_ENV: &str = "BENCHLAB_OLLAMA_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{message} (line {line}:{column})")]
    Yaml {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn from_yaml_error(err: &serde_yaml::Error) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));
        Self::Yaml {
            message: format_yaml_error_message(err),
            line,
            column,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Experiments executed concurrently
    pub workers: usize,
    /// Pending experiments before submission is rejected
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub inference: InferenceConfig,
    /// Defaults merged under each experiment's hyperparameters
    pub hyperparameters: Hyperparameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            inference: InferenceConfig::default(),
            hyperparameters: default_hyperparameters(),
        }
    }
}

pub fn default_hyperparameters() -> Hyperparameters {
    Hyperparameters {
        temperature: Some(0.7),
        top_p: Some(0.9),
        top_k: Some(40),
        context_window: Some(4096),
        max_tokens: Some(512),
    }
}

impl EngineConfig {
    /// Default location: ~/.benchlab/engine.yaml
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".benchlab")
            .join("engine.yaml")
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: EngineConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::from_yaml_error(&e))?;
        config.hyperparameters = config.hyperparameters.resolve(&default_hyperparameters());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_yaml_str(&content)
    }

    /// Load `path`, or the default file if it exists, or built-in defaults.
    /// Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(OLLAMA_URL_ENV).filter(|url| !url.trim().is_empty()) {
            self.inference.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.queue_capacity must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.inference.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("inference.base_url is empty".into()));
        }
        Ok(())
    }
}

/// Experiment definition as written by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub models: Vec<String>,
    #[serde(default)]
    pub embedding_models: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub context_mode: ContextMode,
    /// Document path, relative to the experiment file
    #[serde(default)]
    pub document: Option<PathBuf>,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
}

fn default_iterations() -> u32 {
    1
}

/// A loaded experiment file, with its document text read from disk
#[derive(Debug, Clone)]
pub struct ExperimentParts {
    pub name: String,
    pub config: ExperimentConfig,
    /// (document id, document text)
    pub document: Option<(String, String)>,
}

impl ExperimentFile {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::from_yaml_error(&e))
    }

    /// Read an experiment file and the document it references
    pub fn load(path: impl AsRef<Path>) -> Result<ExperimentParts, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let file = Self::from_yaml_str(&content)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        file.into_parts(base_dir)
    }

    pub fn into_parts(self, base_dir: &Path) -> Result<ExperimentParts, ConfigError> {
        let document = match &self.document {
            Some(doc) => {
                let doc_path = if doc.is_absolute() {
                    doc.clone()
                } else {
                    base_dir.join(doc)
                };
                let text = std::fs::read_to_string(&doc_path)
                    .map_err(|e| ConfigError::io(&doc_path, e))?;
                Some((doc.display().to_string(), text))
            }
            None => None,
        };

        let config = ExperimentConfig {
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            models: self.models,
            embedding_models: self.embedding_models,
            iterations: self.iterations,
            context_mode: self.context_mode,
            hyperparameters: self.hyperparameters,
            retrieval: self.retrieval,
            document_id: document.as_ref().map(|(id, _)| id.clone()),
        };

        Ok(ExperimentParts {
            name: self.name,
            config,
            document,
        })
    }
}

/// Tidy up common serde_yaml messages
fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if let Some(field) = extract_between(&msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }
    if let Some(field) = extract_between(&msg, "unknown field `", "`") {
        return format!("unknown field '{}'", field);
    }

    // serde_yaml appends the location, which is reported separately
    match msg.find(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg,
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}
