// Ollama Client
// HTTP client for a local Ollama server (/api/generate, /api/embeddings)

use crate::config::InferenceConfig;
use crate::inference::{GenerationOutput, GenerationRequest, InferenceClient, InferenceError};
use crate::models::Hyperparameters;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const NANOS_PER_MILLI: f64 = 1_000_000.0;
const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Inference client for the Ollama REST API
#[derive(Clone, Debug)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: ModelOptions,
}

/// Hyperparameters in Ollama's option names
#[derive(Debug, Default, PartialEq, Serialize)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl From<&Hyperparameters> for ModelOptions {
    fn from(params: &Hyperparameters) -> Self {
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            num_ctx: params.context_window,
            num_predict: params.max_tokens,
        }
    }
}

/// Non-streaming `/api/generate` response. Durations are in nanoseconds.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl OllamaClient {
    /// Create a client for the server at `base_url` (e.g. `http://localhost:11434`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self, InferenceError> {
        Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, InferenceError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<R>()
                .await
                .map_err(|e| InferenceError::Response(e.to_string()));
        }

        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(map_status(status, message))
    }

    fn map_transport_error(&self, err: reqwest::Error) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_connect() {
            InferenceError::Connection(err.to_string())
        } else if err.is_decode() {
            InferenceError::Response(err.to_string())
        } else {
            InferenceError::Service(err.to_string())
        }
    }
}

fn map_status(status: StatusCode, message: String) -> InferenceError {
    match status {
        StatusCode::NOT_FOUND => InferenceError::ModelNotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            InferenceError::InvalidRequest(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => InferenceError::Timeout(0),
        _ => InferenceError::Service(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

/// Build run metrics from Ollama's timing fields, falling back to wall time
fn to_output(resp: GenerateResponse, elapsed: Duration) -> GenerationOutput {
    let duration_ms = resp
        .total_duration
        .map(|ns| (ns as f64 / NANOS_PER_MILLI).round() as u64)
        .unwrap_or_else(|| elapsed.as_millis() as u64);

    let tokens_per_second = match (resp.eval_count, resp.eval_duration) {
        (Some(count), Some(ns)) if ns > 0 => Some(count as f64 / (ns as f64 / NANOS_PER_SEC)),
        _ => None,
    };

    let time_to_first_token_ms = match (resp.load_duration, resp.prompt_eval_duration) {
        (None, None) => None,
        (load, prompt) => {
            let ns = load.unwrap_or(0) + prompt.unwrap_or(0);
            Some((ns as f64 / NANOS_PER_MILLI).round() as u64)
        }
    };

    GenerationOutput {
        text: resp.response,
        duration_ms,
        tokens_per_second,
        time_to_first_token_ms,
        prompt_tokens: resp.prompt_eval_count,
        completion_tokens: resp.eval_count,
    }
}

#[async_trait::async_trait]
impl InferenceClient for OllamaClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, InferenceError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system_prompt.as_deref(),
            stream: false,
            options: ModelOptions::from(&request.hyperparameters),
        };

        let start = Instant::now();
        let resp: GenerateResponse = self.post("/api/generate", &body).await?;
        Ok(to_output(resp, start.elapsed()))
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferenceError> {
        let body = EmbeddingsBody { model, prompt: text };
        let resp: EmbeddingsResponse = self.post("/api/embeddings", &body).await?;
        if resp.embedding.is_empty() {
            return Err(InferenceError::Response(format!(
                "empty embedding returned by {}",
                model
            )));
        }
        Ok(resp.embedding)
    }
}
