// Experiment Service
// Lifecycle control (start, pause, resume, cancel) over the worker pool

use crate::config::EngineConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::{
    EventSink, ExecutionState, ExperimentExecutor, PoolError, ProgressBroadcaster,
    ProgressEvent, RunMatrixPlanner, RunPlan, StateSnapshot, Subscription, WorkerPool,
};
use crate::inference::{InferenceClient, InferenceGateway, RetryPolicy};
use crate::models::{
    Experiment, ExperimentConfig, ExperimentId, ExperimentRun, ExperimentStatus, Hyperparameters,
};
use crate::retrieval::{DocumentLibrary, EmbeddingRetriever};
use crate::store::RunStore;

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// How long a lifecycle call waits for a pausing segment to exit
const CLAIM_WAIT: Duration = Duration::from_secs(2);

/// Registry entry for an experiment that has been started and not finished
#[derive(Clone)]
struct ActiveExperiment {
    state: Arc<ExecutionState>,
    plan: Arc<RunPlan>,
    /// Set while an execution segment is queued or running
    in_flight: Arc<AtomicBool>,
    /// Notified when a segment exits without finishing the experiment
    idle: Arc<Notify>,
}

/// Status of an experiment with live progress when it is active
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    pub total_runs: Option<usize>,
    pub completed_runs: Option<usize>,
    pub failed_runs: Option<usize>,
    pub percent_complete: Option<f64>,
}

impl StatusReport {
    fn new(
        experiment_id: ExperimentId,
        status: ExperimentStatus,
        snapshot: Option<StateSnapshot>,
    ) -> Self {
        Self {
            experiment_id,
            status,
            total_runs: snapshot.map(|s| s.total_runs),
            completed_runs: snapshot.map(|s| s.completed_runs),
            failed_runs: snapshot.map(|s| s.failed_runs),
            percent_complete: snapshot.map(|s| s.percent_complete()),
        }
    }
}

/// Entry point for creating and controlling experiments
pub struct ExperimentService {
    store: Arc<dyn RunStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    gateway: Arc<InferenceGateway>,
    executor: Arc<ExperimentExecutor>,
    pool: WorkerPool,
    defaults: Hyperparameters,
    active: Arc<DashMap<ExperimentId, ActiveExperiment>>,
}

impl ExperimentService {
    /// Wire the engine from its configuration. Must be called inside a tokio runtime.
    pub fn new(
        config: &EngineConfig,
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn RunStore>,
        library: Arc<DocumentLibrary>,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let gateway = Arc::new(InferenceGateway::new(
            client,
            RetryPolicy::from(&config.retry),
        ));
        let retriever = Arc::new(EmbeddingRetriever::new(gateway.clone(), library));
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let executor = Arc::new(ExperimentExecutor::new(
            gateway.clone(),
            retriever,
            store.clone(),
            broadcaster.clone(),
        ));

        Ok(Self {
            store,
            broadcaster,
            gateway,
            executor,
            pool: WorkerPool::new(&config.pool),
            defaults: config.hyperparameters.clone(),
            active: Arc::new(DashMap::new()),
        })
    }

    pub fn gateway(&self) -> &Arc<InferenceGateway> {
        &self.gateway
    }

    /// Create a draft experiment
    pub async fn create_experiment(
        &self,
        name: &str,
        config: ExperimentConfig,
    ) -> ServiceResult<Experiment> {
        let experiment = self.store.create_experiment(name, config).await?;
        info!(experiment_id = experiment.id, name, "created experiment");
        Ok(experiment)
    }

    /// Replace a draft's configuration
    pub async fn update_config(
        &self,
        id: ExperimentId,
        config: ExperimentConfig,
    ) -> ServiceResult<Experiment> {
        let experiment = self.store.experiment(id).await?;
        Self::require(&experiment, ExperimentStatus::Draft, "reconfigure")?;
        Ok(self.store.update_config(id, config).await?)
    }

    pub async fn experiment(&self, id: ExperimentId) -> ServiceResult<Experiment> {
        Ok(self.store.experiment(id).await?)
    }

    pub async fn runs(&self, id: ExperimentId) -> ServiceResult<Vec<ExperimentRun>> {
        Ok(self.store.runs(id).await?)
    }

    /// Validate, plan and queue a draft experiment.
    ///
    /// Configuration errors are returned here and leave the experiment a draft.
    pub async fn start(&self, id: ExperimentId) -> ServiceResult<RunPlan> {
        let mut experiment = self.store.experiment(id).await?;
        Self::require(&experiment, ExperimentStatus::Draft, "start")?;

        let plan = RunMatrixPlanner::plan(&experiment.config, &self.defaults)?;
        let entry = ActiveExperiment {
            state: Arc::new(ExecutionState::new(plan.total_runs())),
            plan: Arc::new(plan.clone()),
            in_flight: Arc::new(AtomicBool::new(true)),
            idle: Arc::new(Notify::new()),
        };

        // the registry entry guards against a concurrent start
        match self.active.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ServiceError::InvalidTransition {
                    id,
                    action: "start",
                    status: ExperimentStatus::Running,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
            }
        }

        if let Err(err) = self.store.update_status(id, ExperimentStatus::Running).await {
            self.active.remove(&id);
            return Err(err.into());
        }
        experiment.status = ExperimentStatus::Running;

        if let Err(err) = self.spawn_segment(experiment, entry) {
            self.active.remove(&id);
            self.store.update_status(id, ExperimentStatus::Draft).await?;
            return Err(err.into());
        }

        info!(experiment_id = id, total_runs = plan.total_runs(), "experiment started");
        Ok(plan)
    }

    /// Ask a running experiment to pause before its next run
    pub async fn pause(&self, id: ExperimentId) -> ServiceResult<()> {
        let experiment = self.store.experiment(id).await?;
        Self::require(&experiment, ExperimentStatus::Running, "pause")?;
        let entry = self.entry(&experiment, "pause")?;
        entry.state.request_pause();
        info!(experiment_id = id, "pause requested");
        Ok(())
    }

    /// Continue a paused experiment from its next unexecuted run
    pub async fn resume(&self, id: ExperimentId) -> ServiceResult<()> {
        let mut experiment = self.store.experiment(id).await?;
        Self::require(&experiment, ExperimentStatus::Paused, "resume")?;
        let entry = self.entry(&experiment, "resume")?;
        Self::claim(&experiment, &entry, "resume").await?;

        entry.state.clear_pause();
        if let Err(err) = self.store.update_status(id, ExperimentStatus::Running).await {
            entry.state.request_pause();
            entry.in_flight.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        experiment.status = ExperimentStatus::Running;

        let completed = entry.state.completed_runs();
        if let Err(err) = self.spawn_segment(experiment, entry.clone()) {
            entry.state.request_pause();
            entry.in_flight.store(false, Ordering::SeqCst);
            self.store.update_status(id, ExperimentStatus::Paused).await?;
            return Err(err.into());
        }

        info!(experiment_id = id, resume_index = completed, "experiment resumed");
        Ok(())
    }

    /// Cancel an experiment.
    ///
    /// A running experiment stops before its next run. A paused one has no
    /// execution in progress and fails immediately.
    pub async fn cancel(&self, id: ExperimentId) -> ServiceResult<()> {
        let experiment = self.store.experiment(id).await?;
        match experiment.status {
            ExperimentStatus::Running => {
                let entry = self.entry(&experiment, "cancel")?;
                entry.state.request_cancel();
                info!(experiment_id = id, "cancel requested");

                // the segment may have paused after the status was read
                if entry
                    .in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.cancel_idle(id, &entry).await?;
                }
                Ok(())
            }
            ExperimentStatus::Paused => {
                let entry = self.entry(&experiment, "cancel")?;
                Self::claim(&experiment, &entry, "cancel").await?;
                entry.state.request_cancel();
                self.cancel_idle(id, &entry).await
            }
            status => Err(ServiceError::InvalidTransition {
                id,
                action: "cancel",
                status,
            }),
        }
    }

    pub async fn status(&self, id: ExperimentId) -> ServiceResult<StatusReport> {
        let experiment = self.store.experiment(id).await?;
        let snapshot = self.active.get(&id).map(|entry| entry.state.snapshot());
        Ok(StatusReport::new(id, experiment.status, snapshot))
    }

    /// Receive events published from now on
    pub fn subscribe(&self, id: ExperimentId) -> Subscription {
        self.broadcaster.subscribe(id)
    }

    /// Number of experiments started and not yet finished
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Stop accepting work and wait for queued executions to finish
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn spawn_segment(
        &self,
        experiment: Experiment,
        entry: ActiveExperiment,
    ) -> Result<(), PoolError> {
        let executor = self.executor.clone();
        let store = self.store.clone();
        let active = self.active.clone();
        let broadcaster = self.broadcaster.clone();

        self.pool.submit(async move {
            let id = experiment.id;
            let outcome = executor
                .execute(&experiment, &entry.plan, &entry.state)
                .await;

            if outcome.is_terminal() {
                active.remove(&id);
                broadcaster.close(id);
            } else {
                entry.in_flight.store(false, Ordering::SeqCst);
                entry.idle.notify_waiters();

                // a cancel that saw RUNNING while this segment was pausing
                if entry.state.is_cancelled()
                    && entry
                        .in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    if let Err(err) =
                        finish_idle_cancel(store.as_ref(), &broadcaster, &active, id, &entry).await
                    {
                        warn!(experiment_id = id, error = %err, "failed to finish cancel");
                    }
                }
            }
        })
    }

    fn entry(
        &self,
        experiment: &Experiment,
        action: &'static str,
    ) -> ServiceResult<ActiveExperiment> {
        // an experiment left RUNNING or PAUSED by an earlier process has no entry
        self.active
            .get(&experiment.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                warn!(
                    experiment_id = experiment.id,
                    action,
                    "experiment is not active in this process"
                );
                ServiceError::InvalidTransition {
                    id: experiment.id,
                    action,
                    status: experiment.status,
                }
            })
    }

    /// Take exclusive ownership of an idle paused experiment.
    ///
    /// A segment persists PAUSED just before it exits, so a short wait covers
    /// a resume that races the segment's exit.
    async fn claim(
        experiment: &Experiment,
        entry: &ActiveExperiment,
        action: &'static str,
    ) -> ServiceResult<()> {
        loop {
            let idle = entry.idle.notified();
            if entry
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
            if tokio::time::timeout(CLAIM_WAIT, idle).await.is_err() {
                return Err(ServiceError::InvalidTransition {
                    id: experiment.id,
                    action,
                    status: experiment.status,
                });
            }
        }
    }

    fn require(
        experiment: &Experiment,
        expected: ExperimentStatus,
        action: &'static str,
    ) -> ServiceResult<()> {
        if experiment.status == expected {
            Ok(())
        } else {
            Err(ServiceError::InvalidTransition {
                id: experiment.id,
                action,
                status: experiment.status,
            })
        }
    }

    async fn cancel_idle(&self, id: ExperimentId, entry: &ActiveExperiment) -> ServiceResult<()> {
        finish_idle_cancel(self.store.as_ref(), &self.broadcaster, &self.active, id, entry).await
    }
}

/// Fail an experiment that has no segment running, after a cancel.
///
/// The caller must hold the entry's `in_flight` claim.
async fn finish_idle_cancel(
    store: &dyn RunStore,
    broadcaster: &ProgressBroadcaster,
    active: &DashMap<ExperimentId, ActiveExperiment>,
    id: ExperimentId,
    entry: &ActiveExperiment,
) -> ServiceResult<()> {
    let snapshot = entry.state.snapshot();
    let elapsed_ms = active_time_ms(store, id).await;
    store.update_status(id, ExperimentStatus::Failed).await?;
    broadcaster.publish(
        id,
        ProgressEvent::completed(
            ExperimentStatus::Failed,
            snapshot.total_runs,
            snapshot.successful_runs(),
            snapshot.failed_runs,
            elapsed_ms,
        ),
    );
    active.remove(&id);
    broadcaster.close(id);
    info!(experiment_id = id, "paused experiment cancelled");
    Ok(())
}

/// Wall time spent in persisted runs
async fn active_time_ms(store: &dyn RunStore, id: ExperimentId) -> u64 {
    match store.runs(id).await {
        Ok(runs) => runs
            .iter()
            .filter_map(|run| {
                run.completed_at
                    .map(|done| (done - run.started_at).num_milliseconds().max(0) as u64)
            })
            .sum(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::inference::{InferenceError, MockInferenceClient};
    use crate::store::{InMemoryRunStore, StoreResult};

    /// Holds `update_status(Paused)` until released
    struct PauseGatedStore {
        inner: InMemoryRunStore,
        reached: Notify,
        release: Notify,
    }

    impl PauseGatedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryRunStore::new(),
                reached: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl RunStore for PauseGatedStore {
        async fn create_experiment(
            &self,
            name: &str,
            config: ExperimentConfig,
        ) -> StoreResult<Experiment> {
            self.inner.create_experiment(name, config).await
        }

        async fn experiment(&self, id: ExperimentId) -> StoreResult<Experiment> {
            self.inner.experiment(id).await
        }

        async fn update_config(
            &self,
            id: ExperimentId,
            config: ExperimentConfig,
        ) -> StoreResult<Experiment> {
            self.inner.update_config(id, config).await
        }

        async fn update_status(&self, id: ExperimentId, status: ExperimentStatus) -> StoreResult<()> {
            if status == ExperimentStatus::Paused {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.update_status(id, status).await
        }

        async fn save_run(&self, run: &ExperimentRun) -> StoreResult<()> {
            self.inner.save_run(run).await
        }

        async fn runs(&self, id: ExperimentId) -> StoreResult<Vec<ExperimentRun>> {
            self.inner.runs(id).await
        }
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            retry: RetryConfig {
                initial_delay_ms: 0,
                ..RetryConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn service(client: MockInferenceClient) -> ExperimentService {
        ExperimentService::new(
            &engine_config(),
            Arc::new(client),
            Arc::new(InMemoryRunStore::new()),
            Arc::new(DocumentLibrary::new()),
        )
        .unwrap()
    }

    fn config(models: &[&str], iterations: u32) -> ExperimentConfig {
        ExperimentConfig {
            prompt: "Name three primes.".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            iterations,
            ..Default::default()
        }
    }

    async fn wait_for_end(sub: &mut Subscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(envelope) = sub.recv().await {
            events.push(envelope.event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let service = service(MockInferenceClient::new());
        let exp = service
            .create_experiment("primes", config(&["a", "b"], 2))
            .await
            .unwrap();
        let mut sub = service.subscribe(exp.id);

        let plan = service.start(exp.id).await.unwrap();
        assert_eq!(plan.total_runs(), 4);

        let events = wait_for_end(&mut sub).await;
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::ExperimentCompleted(done)) if done.final_status == ExperimentStatus::Completed
        ));

        let report = service.status(exp.id).await.unwrap();
        assert_eq!(report.status, ExperimentStatus::Completed);
        assert_eq!(service.runs(exp.id).await.unwrap().len(), 4);
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_draft() {
        let service = service(MockInferenceClient::new());
        let exp = service
            .create_experiment("empty", config(&[], 0))
            .await
            .unwrap();

        let err = service.start(exp.id).await.unwrap_err();

        match err {
            ServiceError::Plan(plan) => assert_eq!(plan.errors.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            service.status(exp.id).await.unwrap().status,
            ExperimentStatus::Draft
        );
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_update_config_only_in_draft() {
        let service = service(MockInferenceClient::new());
        let exp = service
            .create_experiment("x", config(&["a"], 1))
            .await
            .unwrap();

        let updated = service
            .update_config(exp.id, config(&["a", "b"], 1))
            .await
            .unwrap();
        assert_eq!(updated.config.models.len(), 2);

        let mut sub = service.subscribe(exp.id);
        service.start(exp.id).await.unwrap();
        wait_for_end(&mut sub).await;

        assert!(matches!(
            service.update_config(exp.id, config(&["c"], 1)).await,
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_transitions_are_checked() {
        let service = service(MockInferenceClient::new());
        let exp = service
            .create_experiment("x", config(&["a"], 1))
            .await
            .unwrap();

        assert!(matches!(
            service.pause(exp.id).await,
            Err(ServiceError::InvalidTransition { action: "pause", .. })
        ));
        assert!(matches!(
            service.resume(exp.id).await,
            Err(ServiceError::InvalidTransition { action: "resume", .. })
        ));
        assert!(matches!(
            service.cancel(exp.id).await,
            Err(ServiceError::InvalidTransition { action: "cancel", .. })
        ));
        assert!(matches!(
            service.start(999).await,
            Err(ServiceError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_failed_runs_still_complete() {
        let service = service(
            MockInferenceClient::new()
                .fail_times(10, InferenceError::Service("overloaded".into())),
        );
        let exp = service
            .create_experiment("flaky", config(&["a"], 2))
            .await
            .unwrap();
        let mut sub = service.subscribe(exp.id);

        service.start(exp.id).await.unwrap();
        let events = wait_for_end(&mut sub).await;

        match events.last() {
            Some(ProgressEvent::ExperimentCompleted(done)) => {
                assert_eq!(done.final_status, ExperimentStatus::Completed);
                assert_eq!(done.failed_runs, 2);
            }
            other => panic!("unexpected final event: {other:?}"),
        }

        // two runs, each retried to the limit of three attempts
        let metrics = service.gateway().metrics();
        assert_eq!(metrics.attempts, 6);
        assert_eq!(metrics.retries, 4);
        assert_eq!(metrics.failures, 2);
    }

    #[tokio::test]
    async fn test_cancel_while_pause_is_recorded() {
        let store = Arc::new(PauseGatedStore::new());
        let service = ExperimentService::new(
            &engine_config(),
            Arc::new(MockInferenceClient::new().with_latency(Duration::from_millis(10))),
            store.clone(),
            Arc::new(DocumentLibrary::new()),
        )
        .unwrap();
        let exp = service
            .create_experiment("late cancel", config(&["a"], 4))
            .await
            .unwrap();
        let mut sub = service.subscribe(exp.id);

        service.start(exp.id).await.unwrap();
        service.pause(exp.id).await.unwrap();

        // the segment has stopped but the store still says RUNNING
        store.reached.notified().await;
        service.cancel(exp.id).await.unwrap();
        store.release.notify_one();

        let events = tokio::time::timeout(Duration::from_secs(5), wait_for_end(&mut sub))
            .await
            .expect("subscription never closed");
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&"EXPERIMENT_PAUSED"));
        match events.last() {
            Some(ProgressEvent::ExperimentCompleted(done)) => {
                assert_eq!(done.final_status, ExperimentStatus::Failed);
                assert_eq!(done.total_runs, 4);
            }
            other => panic!("unexpected final event: {other:?}"),
        }
        assert_eq!(
            service.status(exp.id).await.unwrap().status,
            ExperimentStatus::Failed
        );
        assert_eq!(service.active_count(), 0);
        assert!(matches!(
            service.resume(exp.id).await,
            Err(ServiceError::InvalidTransition { .. })
        ));
    }
}
