// Execution Engine Module
// Run matrix planning, sequential execution, progress events and the worker pool

pub mod broadcaster;
pub mod events;
pub mod executor;
pub mod matrix;
pub mod pool;
pub mod state;

// Re-export key types
pub use broadcaster::{ProgressBroadcaster, Subscription};
pub use events::{EventEnvelope, EventSink, ProgressEvent};
pub use executor::{compose_prompt, ExecutionOutcome, ExperimentExecutor};
pub use matrix::{PlanError, RunMatrixPlanner, RunPlan, ValidationError};
pub use pool::{PoolError, WorkerPool};
pub use state::{ExecutionState, StateSnapshot};
