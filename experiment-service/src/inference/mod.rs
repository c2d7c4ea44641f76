// Inference Module
// Client abstraction over the external inference service, plus the retrying gateway

pub mod gateway;
pub mod mock;
pub mod ollama;
pub mod retry;

pub use gateway::{ErrorClass, GatewayError, InferenceGateway};
pub use mock::MockInferenceClient;
pub use ollama::OllamaClient;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};

use crate::models::Hyperparameters;

use thiserror::Error;

/// A single generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub hyperparameters: Hyperparameters,
}

/// Generated text and the metrics reported by the service
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationOutput {
    pub text: String,
    pub duration_ms: u64,
    pub tokens_per_second: Option<f64>,
    pub time_to_first_token_ms: Option<u64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Errors reported by an inference client for a single attempt
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Inference service error: {0}")]
    Service(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The inference backend itself is gone, not just one call
    #[error("Inference backend lost: {0}")]
    BackendLost(String),

    #[error("Malformed response: {0}")]
    Response(String),
}

/// External inference service
#[async_trait::async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationOutput, InferenceError>;

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferenceError>;
}
