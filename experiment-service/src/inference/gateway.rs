// Inference Gateway
// Retrying wrapper around the inference client with error classification

use crate::inference::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::inference::{GenerationOutput, GenerationRequest, InferenceClient, InferenceError};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Message fragments that mark a service error as a bad request
const BAD_REQUEST_MARKERS: &[&str] = &[
    "invalid",
    "not found",
    "unknown model",
    "no such model",
    "missing model",
    "bad request",
];

/// Terminal failure of a gateway call, after any retries
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("Inference service unavailable after {attempts} attempt(s): {message}")]
    ServiceUnavailable { attempts: u32, message: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal inference error: {0}")]
    Internal(String),

    /// Not a per-call failure: the backend process is gone
    #[error("Inference backend lost: {0}")]
    Critical(String),
}

impl GatewayError {
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }
}

/// How an attempt's error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: connectivity, timeouts, overloaded service
    Retryable,
    /// Fails immediately: invalid request, unknown model, malformed response
    NonRetryable,
    /// Aborts the whole experiment
    Critical,
}

/// Classify a single-attempt error
pub fn classify(error: &InferenceError) -> ErrorClass {
    match error {
        InferenceError::Connection(_) | InferenceError::Timeout(_) => ErrorClass::Retryable,
        InferenceError::Service(message) => {
            if indicates_bad_request(message) {
                ErrorClass::NonRetryable
            } else {
                ErrorClass::Retryable
            }
        }
        InferenceError::InvalidRequest(_)
        | InferenceError::ModelNotFound(_)
        | InferenceError::Response(_) => ErrorClass::NonRetryable,
        InferenceError::BackendLost(_) => ErrorClass::Critical,
    }
}

fn indicates_bad_request(message: &str) -> bool {
    let message = message.to_lowercase();
    BAD_REQUEST_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Attempt counters, for logging and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatewayMetrics {
    pub attempts: u64,
    pub retries: u64,
    pub failures: u64,
}

/// Resilient access to the inference service
pub struct InferenceGateway {
    client: Arc<dyn InferenceClient>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl InferenceGateway {
    pub fn new(client: Arc<dyn InferenceClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            sleeper: Arc::new(TokioSleeper),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Replace the sleeper used between attempts
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn metrics(&self) -> GatewayMetrics {
        GatewayMetrics {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Generate text, retrying transient failures
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GatewayError> {
        self.call_with_retry("generate", &request.model, || self.client.generate(request))
            .await
    }

    /// Embed text, retrying transient failures
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, GatewayError> {
        self.call_with_retry("embed", model, || self.client.embed(model, text))
            .await
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        model: &str,
        mut call: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                self.sleeper.sleep(delay).await;
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            debug!(operation, model, attempt = attempt + 1, max_attempts, "inference attempt");

            let err = match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, model, attempts = attempt + 1, "inference call recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            attempt += 1;
            match classify(&err) {
                ErrorClass::Critical => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(operation, model, error = %err, "inference backend lost");
                    return Err(GatewayError::Critical(err.to_string()));
                }
                ErrorClass::NonRetryable => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(operation, model, error = %err, "non-retryable inference error");
                    return Err(match err {
                        InferenceError::Response(message) => GatewayError::Internal(message),
                        other => GatewayError::BadRequest(other.to_string()),
                    });
                }
                ErrorClass::Retryable if attempt >= max_attempts => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(operation, model, attempts = attempt, error = %err, "inference retries exhausted");
                    return Err(GatewayError::ServiceUnavailable {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                ErrorClass::Retryable => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        operation,
                        model,
                        attempt,
                        max_attempts,
                        retry_in_ms = self.policy.delay_before(attempt).as_millis() as u64,
                        error = %err,
                        "inference attempt failed, retrying"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::MockInferenceClient;
    use crate::models::Hyperparameters;

    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn request(model: &str) -> GenerationRequest {
        GenerationRequest {
            model: model.to_string(),
            prompt: "What is the capital of France?".to_string(),
            system_prompt: None,
            hyperparameters: Hyperparameters::default(),
        }
    }

    fn gateway(
        client: Arc<MockInferenceClient>,
        policy: RetryPolicy,
    ) -> (InferenceGateway, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let gateway = InferenceGateway::new(client, policy).with_sleeper(sleeper.clone());
        (gateway, sleeper)
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&InferenceError::Connection("refused".into())),
            ErrorClass::Retryable
        );
        assert_eq!(classify(&InferenceError::Timeout(5000)), ErrorClass::Retryable);
        assert_eq!(
            classify(&InferenceError::Service("server overloaded".into())),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&InferenceError::Service(
                "model 'llama9' not found, try pulling it first".into()
            )),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            classify(&InferenceError::Service("Invalid options".into())),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            classify(&InferenceError::ModelNotFound("x".into())),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            classify(&InferenceError::BackendLost("process exited".into())),
            ErrorClass::Critical
        );
    }

    #[tokio::test]
    async fn test_fail_twice_then_succeed() {
        let client = Arc::new(MockInferenceClient::new().fail_times(
            2,
            InferenceError::Connection("connection refused".into()),
        ));
        let (gateway, sleeper) = gateway(client.clone(), RetryPolicy::default());

        let output = gateway.generate(&request("llama3")).await.unwrap();

        assert!(!output.text.is_empty());
        assert_eq!(client.generate_calls(), 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        let metrics = gateway.metrics();
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.failures, 0);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let client = Arc::new(
            MockInferenceClient::new().fail_times(10, InferenceError::Timeout(30_000)),
        );
        let (gateway, sleeper) = gateway(client.clone(), RetryPolicy::new(4, 100, 3.0));

        let err = gateway.generate(&request("llama3")).await.unwrap_err();

        assert_eq!(client.generate_calls(), 4);
        assert!(matches!(err, GatewayError::ServiceUnavailable { attempts: 4, .. }));
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(900)
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_model_fails_immediately() {
        let client = Arc::new(MockInferenceClient::new().with_unknown_model("ghost"));
        let (gateway, sleeper) = gateway(client.clone(), RetryPolicy::default());

        let err = gateway.generate(&request("ghost")).await.unwrap_err();

        assert_eq!(client.generate_calls(), 1);
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_loss_is_critical() {
        let client = Arc::new(MockInferenceClient::new().fail_times(
            1,
            InferenceError::BackendLost("ollama process exited".into()),
        ));
        let (gateway, _) = gateway(client.clone(), RetryPolicy::default());

        let err = gateway.generate(&request("llama3")).await.unwrap_err();

        assert!(err.is_critical());
        assert_eq!(client.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_embed_is_retried() {
        let client = Arc::new(
            MockInferenceClient::new()
                .fail_times(1, InferenceError::Service("busy".into())),
        );
        let (gateway, _) = gateway(client.clone(), RetryPolicy::default());

        let vector = gateway.embed("nomic-embed-text", "hello").await.unwrap();

        assert!(!vector.is_empty());
        assert_eq!(client.embed_calls(), 2);
    }
}
