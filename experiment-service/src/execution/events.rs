// Execution Events
// Progress event types emitted while an experiment runs

use crate::models::{ExperimentId, ExperimentRun, ExperimentStatus, RunSpec, RunStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events for one experiment.
///
/// Serialized as `{"type": "RUN_STARTED", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressEvent {
    RunStarted(RunStarted),
    RunCompleted(RunCompleted),
    Progress(Progress),
    ExperimentPaused(ExperimentPaused),
    ExperimentCompleted(ExperimentCompleted),
    Error(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_index: usize,
    pub total_runs: usize,
    pub model: String,
    pub embedding_model: Option<String>,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompleted {
    pub run_index: usize,
    pub run_id: String,
    pub model: String,
    pub embedding_model: Option<String>,
    pub iteration: u32,
    pub status: RunStatus,
    pub duration_ms: Option<u64>,
    pub tokens_per_second: Option<f64>,
    pub time_to_first_token_ms: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub total_runs: usize,
    pub percent_complete: f64,
    /// `None` until at least one run has completed
    pub estimated_time_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentPaused {
    pub completed_runs: usize,
    pub remaining_runs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentCompleted {
    pub final_status: ExperimentStatus,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub recoverable: bool,
}

impl ProgressEvent {
    /// Create a run started event
    pub fn run_started(spec: &RunSpec, total_runs: usize) -> Self {
        Self::RunStarted(RunStarted {
            run_index: spec.index,
            total_runs,
            model: spec.model.clone(),
            embedding_model: spec.embedding_model.clone(),
            iteration: spec.iteration,
        })
    }

    /// Create a run completed event from the persisted record
    pub fn run_completed(run: &ExperimentRun) -> Self {
        Self::RunCompleted(RunCompleted {
            run_index: run.run_index,
            run_id: run.id.clone(),
            model: run.model.clone(),
            embedding_model: run.embedding_model.clone(),
            iteration: run.iteration,
            status: run.status,
            duration_ms: run.duration_ms,
            tokens_per_second: run.tokens_per_second,
            time_to_first_token_ms: run.time_to_first_token_ms,
            error_message: run.error_message.clone(),
        })
    }

    pub fn progress(
        completed_runs: usize,
        failed_runs: usize,
        total_runs: usize,
        estimated_time_remaining_ms: Option<u64>,
    ) -> Self {
        let percent_complete = if total_runs == 0 {
            100.0
        } else {
            completed_runs as f64 / total_runs as f64 * 100.0
        };
        Self::Progress(Progress {
            completed_runs,
            failed_runs,
            total_runs,
            percent_complete,
            estimated_time_remaining_ms,
        })
    }

    pub fn paused(completed_runs: usize, total_runs: usize) -> Self {
        Self::ExperimentPaused(ExperimentPaused {
            completed_runs,
            remaining_runs: total_runs.saturating_sub(completed_runs),
        })
    }

    pub fn completed(
        final_status: ExperimentStatus,
        total_runs: usize,
        successful_runs: usize,
        failed_runs: usize,
        total_duration_ms: u64,
    ) -> Self {
        Self::ExperimentCompleted(ExperimentCompleted {
            final_status,
            total_runs,
            successful_runs,
            failed_runs,
            total_duration_ms,
        })
    }

    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error(ErrorReport {
            message: message.into(),
            recoverable,
        })
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted(_) => "RUN_STARTED",
            Self::RunCompleted(_) => "RUN_COMPLETED",
            Self::Progress(_) => "PROGRESS",
            Self::ExperimentPaused(_) => "EXPERIMENT_PAUSED",
            Self::ExperimentCompleted(_) => "EXPERIMENT_COMPLETED",
            Self::Error(_) => "ERROR",
        }
    }
}

/// Event as delivered to subscribers: `{type, experimentId, payload, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: ProgressEvent,
    pub experiment_id: ExperimentId,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(experiment_id: ExperimentId, event: ProgressEvent) -> Self {
        Self {
            event,
            experiment_id,
            timestamp: Utc::now(),
        }
    }
}

/// Topic-addressed publisher used by the executor.
///
/// Publishing is fire-and-forget: a missing or disconnected subscriber never
/// fails the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, experiment_id: ExperimentId, event: ProgressEvent);
}
