// Experiment Executor
// Runs a planned matrix sequentially, honouring pause and cancel between runs

use crate::execution::events::{EventSink, ProgressEvent};
use crate::execution::matrix::RunPlan;
use crate::execution::state::ExecutionState;
use crate::inference::{GenerationRequest, InferenceGateway};
use crate::models::{
    ContextMode, Experiment, ExperimentId, ExperimentRun, ExperimentStatus, RunSpec,
};
use crate::retrieval::{ContextAssembler, ContextError, ContextRequest};
use crate::store::RunStore;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a call to [`ExperimentExecutor::execute`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every planned run was processed
    Completed,
    /// Stopped at a run boundary; can be resumed
    Paused,
    /// Stopped at a run boundary by a cancel request
    Cancelled,
    /// Stopped by a critical failure
    Aborted(String),
}

impl ExecutionOutcome {
    /// Experiment status after this outcome
    pub fn status(&self) -> ExperimentStatus {
        match self {
            Self::Completed => ExperimentStatus::Completed,
            Self::Paused => ExperimentStatus::Paused,
            Self::Cancelled | Self::Aborted(_) => ExperimentStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Result of a single run
enum RunOutcome {
    /// Success or a run-scoped failure; execution continues
    Finished(ExperimentRun),
    /// The run failed and the experiment cannot continue
    Critical(ExperimentRun, String),
}

/// Mean wall time per run, for the remaining-time estimate
#[derive(Debug, Default)]
struct EtaEstimator {
    total: Duration,
    samples: u32,
}

impl EtaEstimator {
    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.samples += 1;
    }

    fn remaining_ms(&self, remaining_runs: usize) -> Option<u64> {
        if self.samples == 0 {
            return None;
        }
        let mean = self.total / self.samples;
        Some((mean.as_millis() as u64).saturating_mul(remaining_runs as u64))
    }
}

/// Wrap the task prompt with assembled context
pub fn compose_prompt(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(context) if !context.trim().is_empty() => {
            format!("Context:\n{}\n\nQuestion:\n{}", context, prompt)
        }
        _ => prompt.to_string(),
    }
}

/// Executes an experiment's run plan against its collaborators
pub struct ExperimentExecutor {
    gateway: Arc<InferenceGateway>,
    context: Arc<dyn ContextAssembler>,
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
}

impl ExperimentExecutor {
    pub fn new(
        gateway: Arc<InferenceGateway>,
        context: Arc<dyn ContextAssembler>,
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            gateway,
            context,
            store,
            events,
        }
    }

    /// Execute the plan starting at `state.completed_runs()`.
    ///
    /// The caller sets the experiment RUNNING before calling; this sets the
    /// status the outcome implies. Runs already persisted are never repeated.
    pub async fn execute(
        &self,
        experiment: &Experiment,
        plan: &RunPlan,
        state: &ExecutionState,
    ) -> ExecutionOutcome {
        let id = experiment.id;
        let total_runs = plan.total_runs();
        let segment_start = Instant::now();
        let (mut eta, prior_elapsed) = self.seed_estimate(id, state).await;

        info!(
            experiment_id = id,
            total_runs,
            start_index = state.completed_runs(),
            "executing experiment"
        );

        loop {
            // cancel wins over pause when both are set
            if state.is_cancelled() {
                let elapsed = prior_elapsed + segment_start.elapsed();
                return self.finish_cancelled(id, state, elapsed).await;
            }
            if state.is_paused() {
                return self.finish_paused(id, state).await;
            }

            let Some(spec) = plan.get(state.completed_runs()) else {
                break;
            };

            self.events
                .publish(id, ProgressEvent::run_started(spec, total_runs));
            debug!(experiment_id = id, run_index = spec.index, run = %spec.label(), "run started");

            let run_start = Instant::now();
            let (run, critical) = match self.execute_run(experiment, spec).await {
                RunOutcome::Finished(run) => (run, None),
                RunOutcome::Critical(run, message) => (run, Some(message)),
            };

            if let Err(err) = self.store.save_run(&run).await {
                return self
                    .abort(id, format!("failed to persist run {}: {}", run.id, err))
                    .await;
            }

            state.record_run(!run.is_success());
            eta.record(run_start.elapsed());

            match &run.error_message {
                Some(message) => warn!(
                    experiment_id = id,
                    run_index = run.run_index,
                    model = %run.model,
                    error = %message,
                    "run failed"
                ),
                None => info!(
                    experiment_id = id,
                    run_index = run.run_index,
                    model = %run.model,
                    duration_ms = run.duration_ms.unwrap_or(0),
                    "run succeeded"
                ),
            }

            self.events.publish(id, ProgressEvent::run_completed(&run));
            let snapshot = state.snapshot();
            self.events.publish(
                id,
                ProgressEvent::progress(
                    snapshot.completed_runs,
                    snapshot.failed_runs,
                    total_runs,
                    eta.remaining_ms(snapshot.remaining_runs()),
                ),
            );

            if let Some(message) = critical {
                return self.abort(id, message).await;
            }
        }

        let snapshot = state.snapshot();
        self.set_status(id, ExperimentStatus::Completed).await;
        self.events.publish(
            id,
            ProgressEvent::completed(
                ExperimentStatus::Completed,
                total_runs,
                snapshot.successful_runs(),
                snapshot.failed_runs,
                (prior_elapsed + segment_start.elapsed()).as_millis() as u64,
            ),
        );
        info!(
            experiment_id = id,
            successful_runs = snapshot.successful_runs(),
            failed_runs = snapshot.failed_runs,
            "experiment completed"
        );
        ExecutionOutcome::Completed
    }

    async fn execute_run(&self, experiment: &Experiment, spec: &RunSpec) -> RunOutcome {
        let config = &experiment.config;
        let run = ExperimentRun::begin(experiment.id, spec);

        let context = match self.resolve_context(experiment, spec).await {
            Ok(context) => context,
            Err(err) if err.is_critical() => {
                let message = err.to_string();
                return RunOutcome::Critical(run.fail(message.clone(), None), message);
            }
            Err(err) => {
                return RunOutcome::Finished(
                    run.fail(format!("context assembly failed: {}", err), None),
                );
            }
        };

        // only retrieved chunks are kept on the run, not whole documents
        let retrieved = match spec.embedding_model {
            Some(_) => context.clone(),
            None => None,
        };

        let request = GenerationRequest {
            model: spec.model.clone(),
            prompt: compose_prompt(&config.prompt, context.as_deref()),
            system_prompt: config.system_prompt.clone(),
            hyperparameters: spec.hyperparameters.clone(),
        };

        match self.gateway.generate(&request).await {
            Ok(output) => RunOutcome::Finished(run.succeed(output, retrieved)),
            Err(err) if err.is_critical() => {
                let message = err.to_string();
                RunOutcome::Critical(run.fail(message.clone(), retrieved), message)
            }
            Err(err) => RunOutcome::Finished(run.fail(err.to_string(), retrieved)),
        }
    }

    async fn resolve_context(
        &self,
        experiment: &Experiment,
        spec: &RunSpec,
    ) -> Result<Option<String>, ContextError> {
        let config = &experiment.config;
        let Some(document_id) = &config.document_id else {
            return Ok(None);
        };

        match (&spec.embedding_model, config.context_mode) {
            (Some(embedding_model), _) => {
                let request = ContextRequest {
                    query: config.prompt.clone(),
                    document_id: document_id.clone(),
                    embedding_model: embedding_model.clone(),
                    top_k: config.retrieval.top_k,
                    chunk_size: config.retrieval.chunk_size,
                    chunk_overlap: config.retrieval.chunk_overlap,
                };
                let assembled = self.context.assemble_context(&request).await?;
                debug!(
                    experiment_id = experiment.id,
                    run_index = spec.index,
                    chunks = assembled.chunks.len(),
                    "assembled context"
                );
                Ok(Some(assembled.text))
            }
            (None, ContextMode::FullContext) => {
                Ok(Some(self.context.full_document(document_id).await?))
            }
            (None, _) => Ok(None),
        }
    }

    /// Seed the estimate from runs persisted by earlier segments
    async fn seed_estimate(
        &self,
        id: ExperimentId,
        state: &ExecutionState,
    ) -> (EtaEstimator, Duration) {
        let mut eta = EtaEstimator::default();
        if state.completed_runs() == 0 {
            return (eta, Duration::ZERO);
        }

        match self.store.runs(id).await {
            Ok(runs) => {
                for run in runs {
                    if let Some(completed_at) = run.completed_at {
                        let ms = (completed_at - run.started_at).num_milliseconds().max(0);
                        eta.record(Duration::from_millis(ms as u64));
                    }
                }
            }
            Err(err) => warn!(experiment_id = id, error = %err, "could not load persisted runs"),
        }
        let prior = eta.total;
        (eta, prior)
    }

    async fn finish_paused(&self, id: ExperimentId, state: &ExecutionState) -> ExecutionOutcome {
        let snapshot = state.snapshot();
        self.set_status(id, ExperimentStatus::Paused).await;
        self.events.publish(
            id,
            ProgressEvent::paused(snapshot.completed_runs, snapshot.total_runs),
        );
        info!(
            experiment_id = id,
            completed_runs = snapshot.completed_runs,
            remaining_runs = snapshot.remaining_runs(),
            "experiment paused"
        );
        ExecutionOutcome::Paused
    }

    async fn finish_cancelled(
        &self,
        id: ExperimentId,
        state: &ExecutionState,
        elapsed: Duration,
    ) -> ExecutionOutcome {
        let snapshot = state.snapshot();
        self.set_status(id, ExperimentStatus::Failed).await;
        self.events.publish(
            id,
            ProgressEvent::completed(
                ExperimentStatus::Failed,
                snapshot.total_runs,
                snapshot.successful_runs(),
                snapshot.failed_runs,
                elapsed.as_millis() as u64,
            ),
        );
        info!(
            experiment_id = id,
            completed_runs = snapshot.completed_runs,
            "experiment cancelled"
        );
        ExecutionOutcome::Cancelled
    }

    async fn abort(&self, id: ExperimentId, message: String) -> ExecutionOutcome {
        error!(experiment_id = id, error = %message, "experiment aborted");
        self.events.publish(id, ProgressEvent::error(message.clone(), false));
        self.set_status(id, ExperimentStatus::Failed).await;
        ExecutionOutcome::Aborted(message)
    }

    async fn set_status(&self, id: ExperimentId, status: ExperimentStatus) {
        if let Err(err) = self.store.update_status(id, status).await {
            error!(experiment_id = id, %status, error = %err, "failed to update experiment status");
        }
    }
}
