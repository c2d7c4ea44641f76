// Mock Inference Client
// Deterministic in-process stand-in for the inference service

use crate::inference::{GenerationOutput, GenerationRequest, InferenceClient, InferenceError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Dimension of the vectors returned by [`MockInferenceClient::embed`]
pub const MOCK_EMBEDDING_DIM: usize = 32;

/// Inference client returning canned responses.
///
/// Failures can be scripted: a number of leading failures shared by all
/// calls, or permanent errors for specific models. Every request is recorded.
#[derive(Debug, Default)]
pub struct MockInferenceClient {
    response: Option<String>,
    latency: Option<Duration>,
    leading_failures: AtomicUsize,
    leading_error: Option<InferenceError>,
    model_errors: HashMap<String, InferenceError>,
    generate_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with fixed text instead of the default echo
    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.response = Some(text.into());
        self
    }

    /// Sleep for `latency` on every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the first `count` calls with `error`
    pub fn fail_times(mut self, count: usize, error: InferenceError) -> Self {
        self.leading_failures = AtomicUsize::new(count);
        self.leading_error = Some(error);
        self
    }

    /// Always fail calls for `model` with `error`
    pub fn with_model_error(mut self, model: impl Into<String>, error: InferenceError) -> Self {
        self.model_errors.insert(model.into(), error);
        self
    }

    /// Always reject `model` as unknown
    pub fn with_unknown_model(self, model: impl Into<String>) -> Self {
        let model = model.into();
        let error = InferenceError::ModelNotFound(model.clone());
        self.with_model_error(model, error)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Generation requests received so far, in call order
    pub fn requests(&self) -> Vec<GenerationRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn before_call(&self, model: &str) -> Result<(), InferenceError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.model_errors.get(model) {
            return Err(error.clone());
        }

        if let Some(error) = &self.leading_error {
            let took = self
                .leading_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if took {
                return Err(error.clone());
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl InferenceClient for MockInferenceClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, InferenceError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        match self.requests.lock() {
            Ok(mut requests) => requests.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }

        self.before_call(&request.model).await?;

        let text = self
            .response
            .clone()
            .unwrap_or_else(|| format!("[{}] {}", request.model, first_line(&request.prompt)));
        let completion_tokens = text.split_whitespace().count() as u32;
        let prompt_tokens = request.prompt.split_whitespace().count() as u32;
        let duration_ms = self.latency.map(|d| d.as_millis() as u64).unwrap_or(0).max(1);

        Ok(GenerationOutput {
            text,
            duration_ms,
            tokens_per_second: Some(completion_tokens as f64 / (duration_ms as f64 / 1000.0)),
            time_to_first_token_ms: Some(duration_ms / 4),
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferenceError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(model).await?;
        Ok(bag_of_words(text))
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Hashed bag-of-words vector, so similar texts get similar embeddings
fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; MOCK_EMBEDDING_DIM];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        vector[bucket % MOCK_EMBEDDING_DIM] += 1.0;
    }
    vector
}
