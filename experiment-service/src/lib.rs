// Experiment Service Library
// Execution engine for LLM benchmark experiments

pub mod config;
pub mod error;
pub mod execution;
pub mod inference;
pub mod models;
pub mod retrieval;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};
pub use service::{ExperimentService, StatusReport};

// Re-export configuration types
pub use config::{ConfigError, EngineConfig, ExperimentFile, ExperimentParts};

// Re-export model types
pub use models::{
    ContextMode, Experiment, ExperimentConfig, ExperimentId, ExperimentRun, ExperimentStatus,
    Hyperparameters, RetrievalSettings, RunSpec, RunStatus,
};

// Re-export execution types
pub use execution::{
    EventEnvelope, EventSink, ExecutionOutcome, ExecutionState, ExperimentExecutor, PlanError,
    ProgressBroadcaster, ProgressEvent, RunMatrixPlanner, RunPlan, Subscription, WorkerPool,
};

// Re-export inference types
pub use inference::{
    GatewayError, GenerationOutput, GenerationRequest, InferenceClient, InferenceError,
    InferenceGateway, MockInferenceClient, OllamaClient, RetryPolicy,
};

// Re-export collaborator types
pub use retrieval::{ContextAssembler, DocumentLibrary, EmbeddingRetriever};
pub use store::{InMemoryRunStore, JsonlRunStore, RunStore, StoreError};
