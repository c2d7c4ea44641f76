// Experiment Models
// Experiments, their configuration, planned runs and persisted run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::GenerationOutput;

/// Identity of an experiment, assigned by the run store
pub type ExperimentId = u64;

/// Lifecycle status of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ExperimentStatus {
    /// Completed and failed experiments never change status again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "DRAFT",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// How a run's prompt is augmented with document context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Prompt is sent as-is
    #[default]
    None,
    /// Prompt is augmented with chunks retrieved by embedding similarity
    Rag,
    /// The whole document is inlined into the prompt
    FullContext,
}

impl ContextMode {
    pub fn uses_retrieval(self) -> bool {
        self == Self::Rag
    }
}

/// Generation controls. Unset values fall back to engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Hyperparameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Hyperparameters {
    /// Fill every unset value from `defaults`
    pub fn resolve(&self, defaults: &Hyperparameters) -> Hyperparameters {
        Hyperparameters {
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            context_window: self.context_window.or(defaults.context_window),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
        }
    }
}

/// Retrieval settings passed to the context-assembly collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// Experiment configuration. Only editable while the experiment is a draft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExperimentConfig {
    /// Resolved task prompt
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Models to benchmark, in execution order
    pub models: Vec<String>,
    /// Embedding models for retrieval, in execution order
    pub embedding_models: Vec<String>,
    pub iterations: u32,
    pub context_mode: ContextMode,
    pub hyperparameters: Hyperparameters,
    pub retrieval: RetrievalSettings,
    /// Document used for retrieval or full-context runs
    pub document_id: Option<String>,
}

/// A benchmark experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub config: ExperimentConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    /// Create a new experiment in draft status
    pub fn draft(id: ExperimentId, name: impl Into<String>, config: ExperimentConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            status: ExperimentStatus::Draft,
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One planned combination from the run matrix
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    /// Position in the planned matrix (0-based)
    pub index: usize,
    pub model: String,
    pub embedding_model: Option<String>,
    /// Iteration number (1-based)
    pub iteration: u32,
    pub hyperparameters: Hyperparameters,
}

impl RunSpec {
    /// Short human-readable label, e.g. `llama3/nomic-embed/2`
    pub fn label(&self) -> String {
        match &self.embedding_model {
            Some(embedding) => format!("{}/{}/{}", self.model, embedding, self.iteration),
            None => format!("{}/{}", self.model, self.iteration),
        }
    }
}

/// Status of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Persisted record of one executed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRun {
    pub id: String,
    pub experiment_id: ExperimentId,
    pub run_index: usize,
    pub model: String,
    pub embedding_model: Option<String>,
    pub iteration: u32,
    pub status: RunStatus,
    pub output: Option<String>,
    pub duration_ms: Option<u64>,
    pub tokens_per_second: Option<f64>,
    pub time_to_first_token_ms: Option<u64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    /// Context text retrieved for RAG runs
    pub retrieved_context: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExperimentRun {
    /// Create the record for a run that is starting now
    pub fn begin(experiment_id: ExperimentId, spec: &RunSpec) -> Self {
        Self {
            id: format!("{}-{}", experiment_id, spec.index),
            experiment_id,
            run_index: spec.index,
            model: spec.model.clone(),
            embedding_model: spec.embedding_model.clone(),
            iteration: spec.iteration,
            status: RunStatus::Running,
            output: None,
            duration_ms: None,
            tokens_per_second: None,
            time_to_first_token_ms: None,
            prompt_tokens: None,
            completion_tokens: None,
            retrieved_context: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Finalize as successful with the measured metrics
    pub fn succeed(mut self, output: GenerationOutput, retrieved_context: Option<String>) -> Self {
        self.status = RunStatus::Success;
        self.output = Some(output.text);
        self.duration_ms = Some(output.duration_ms);
        self.tokens_per_second = output.tokens_per_second;
        self.time_to_first_token_ms = output.time_to_first_token_ms;
        self.prompt_tokens = output.prompt_tokens;
        self.completion_tokens = output.completion_tokens;
        self.retrieved_context = retrieved_context;
        self.completed_at = Some(Utc::now());
        self
    }

    /// Finalize as failed with the given error message
    pub fn fail(mut self, message: impl Into<String>, retrieved_context: Option<String>) -> Self {
        self.status = RunStatus::Failed;
        self.error_message = Some(message.into());
        self.retrieved_context = retrieved_context;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunSpec {
        RunSpec {
            index: 4,
            model: "llama3".to_string(),
            embedding_model: None,
            iteration: 2,
            hyperparameters: Hyperparameters::default(),
        }
    }

    #[test]
    fn test_hyperparameters_resolve() {
        let defaults = Hyperparameters {
            temperature: Some(0.7),
            top_p: Some(0.9),
            top_k: Some(40),
            context_window: Some(4096),
            max_tokens: Some(512),
        };
        let overrides = Hyperparameters {
            temperature: Some(0.1),
            max_tokens: Some(64),
            ..Default::default()
        };

        let resolved = overrides.resolve(&defaults);
        assert_eq!(resolved.temperature, Some(0.1));
        assert_eq!(resolved.top_p, Some(0.9));
        assert_eq!(resolved.top_k, Some(40));
        assert_eq!(resolved.max_tokens, Some(64));
    }

    #[test]
    fn test_run_lifecycle() {
        let run = ExperimentRun::begin(7, &spec());
        assert_eq!(run.id, "7-4");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());

        let failed = run.fail("model not found", None);
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("model not found"));
        assert!(failed.completed_at.is_some());
        assert!(!failed.is_success());
    }

    #[test]
    fn test_run_spec_label() {
        let mut s = spec();
        assert_eq!(s.label(), "llama3/2");
        s.embedding_model = Some("nomic".to_string());
        assert_eq!(s.label(), "llama3/nomic/2");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExperimentStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        assert!(ExperimentStatus::Failed.is_terminal());
        assert!(!ExperimentStatus::Paused.is_terminal());
    }
}
