// Run Store
// Persistence of experiments and their run records

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlRunStore;
pub use memory::InMemoryRunStore;

use crate::models::{Experiment, ExperimentConfig, ExperimentId, ExperimentRun, ExperimentStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence of experiments and run results.
///
/// Runs are saved one at a time as they finish; a saved run is never
/// executed again.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Store a new draft experiment, assigning its id
    async fn create_experiment(
        &self,
        name: &str,
        config: ExperimentConfig,
    ) -> StoreResult<Experiment>;

    async fn experiment(&self, id: ExperimentId) -> StoreResult<Experiment>;

    async fn update_config(&self, id: ExperimentId, config: ExperimentConfig)
        -> StoreResult<Experiment>;

    async fn update_status(&self, id: ExperimentId, status: ExperimentStatus) -> StoreResult<()>;

    async fn save_run(&self, run: &ExperimentRun) -> StoreResult<()>;

    /// Saved runs of an experiment, ordered by run index
    async fn runs(&self, id: ExperimentId) -> StoreResult<Vec<ExperimentRun>>;
}
