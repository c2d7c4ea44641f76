// In-Memory Run Store
// DashMap-backed store used by tests and as the base of the JSONL store

use crate::models::{Experiment, ExperimentConfig, ExperimentId, ExperimentRun, ExperimentStatus};
use crate::store::{RunStore, StoreError, StoreResult};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct InMemoryRunStore {
    next_id: AtomicU64,
    experiments: DashMap<ExperimentId, Experiment>,
    runs: DashMap<ExperimentId, Vec<ExperimentRun>>,
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            experiments: DashMap::new(),
            runs: DashMap::new(),
        }
    }
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    fn modify<F>(&self, id: ExperimentId, f: F) -> StoreResult<Experiment>
    where
        F: FnOnce(&mut Experiment),
    {
        let mut entry = self
            .experiments
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        f(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_experiment(
        &self,
        name: &str,
        config: ExperimentConfig,
    ) -> StoreResult<Experiment> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let experiment = Experiment::draft(id, name, config);
        self.experiments.insert(id, experiment.clone());
        Ok(experiment)
    }

    async fn experiment(&self, id: ExperimentId) -> StoreResult<Experiment> {
        self.experiments
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_config(
        &self,
        id: ExperimentId,
        config: ExperimentConfig,
    ) -> StoreResult<Experiment> {
        self.modify(id, |experiment| experiment.config = config)
    }

    async fn update_status(&self, id: ExperimentId, status: ExperimentStatus) -> StoreResult<()> {
        self.modify(id, |experiment| experiment.status = status)?;
        Ok(())
    }

    async fn save_run(&self, run: &ExperimentRun) -> StoreResult<()> {
        if !self.experiments.contains_key(&run.experiment_id) {
            return Err(StoreError::NotFound(run.experiment_id));
        }
        let mut runs = self.runs.entry(run.experiment_id).or_default();
        match runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn runs(&self, id: ExperimentId) -> StoreResult<Vec<ExperimentRun>> {
        if !self.experiments.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let mut runs = self
            .runs
            .get(&id)
            .map(|runs| runs.value().clone())
            .unwrap_or_default();
        runs.sort_by_key(|run| run.run_index);
        Ok(runs)
    }
}
