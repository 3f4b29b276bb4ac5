use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::QuillError;
use crate::request::{Request, Response};

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

// Fixed sampling parameters. Provider defaults, not user-tunable here.
const TEMPERATURE: f64 = 0.7;
const MAX_TOKENS: u64 = 2048;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for one OpenAI-compatible chat-completion endpoint.
///
/// `send_request` hides transport retries, the per-attempt timeout, and
/// cooperative cancellation from the caller; every failure surfaces as a
/// classified [`QuillError`], never a raw transport error.
pub struct RequestClient {
    client: Client,
    config: Config,
    /// Request id → abort handle for the in-flight exchange. Entries are
    /// removed on every exit path: at most one in-flight transport per id.
    inflight: Mutex<HashMap<String, CancellationToken>>,
}

impl RequestClient {
    pub fn new(config: Config) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .http1_title_case_headers()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of registered in-flight exchanges (for testing).
    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Send one prompt and return the model's answer, retrying transient
    /// failures with exponential backoff (1s, 2s, 4s, ...). Cancellation
    /// always short-circuits the retry loop, even after a retryable failure.
    pub async fn send_request(&self, request: &Request) -> Result<Response, QuillError> {
        self.send_request_with_abort(request, CancellationToken::new())
            .await
    }

    /// Like `send_request`, but under a caller-supplied abort handle. The
    /// queue creates the handle at admission time, so a cancel that lands
    /// before the spawned task first polls still aborts the exchange
    /// instead of racing the in-flight registration.
    pub async fn send_request_with_abort(
        &self,
        request: &Request,
        abort: CancellationToken,
    ) -> Result<Response, QuillError> {
        lock(&self.inflight).insert(request.id.clone(), abort.clone());

        let delivered = AtomicBool::new(false);
        let result = self.run_attempts(request, &abort, &delivered).await;

        lock(&self.inflight).remove(&request.id);
        result
    }

    /// Abort the in-flight exchange registered for `id`. Unknown ids are a
    /// no-op, never an error.
    pub fn cancel_request(&self, id: &str) {
        if let Some(abort) = lock(&self.inflight).remove(id) {
            tracing::debug!(id, "aborting in-flight request");
            abort.cancel();
        }
    }

    /// Minimal single-message probe. True iff the endpoint answered with a
    /// success status. Never errors — all failures yield false.
    pub async fn test_connection(&self) -> bool {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });

        let mut builder = self
            .client
            .post(&self.config.api_endpoint)
            .timeout(PROBE_TIMEOUT)
            .json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        match builder.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("connection probe failed: {e}");
                false
            }
        }
    }

    async fn run_attempts(
        &self,
        request: &Request,
        abort: &CancellationToken,
        delivered: &AtomicBool,
    ) -> Result<Response, QuillError> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.execute_attempt(request, abort, delivered).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if request.is_cancelled() || abort.is_cancelled() {
                return Err(QuillError::Cancelled);
            }
            // Once a fragment has reached the consumer, a retry would
            // replay the already-delivered prefix. The failure is terminal.
            if delivered.load(Ordering::Relaxed) {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                return Err(err);
            }

            attempt += 1;
            // Deterministic backoff, no jitter: 2^(attempt-1) seconds.
            let delay = Duration::from_secs(1u64 << (attempt - 1));
            tracing::debug!(
                id = %request.id,
                attempt,
                delay_s = delay.as_secs(),
                "retrying after transient failure: {err}"
            );

            tokio::select! {
                biased;
                _ = user_cancelled(request) => return Err(QuillError::Cancelled),
                _ = abort.cancelled() => return Err(QuillError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One HTTP attempt raced against the timeout timer and both
    /// cancellation sources. Dropping the transport future is the abort; the
    /// timer and cancel arms disarm themselves the same way.
    async fn execute_attempt(
        &self,
        request: &Request,
        abort: &CancellationToken,
        delivered: &AtomicBool,
    ) -> Result<Response, QuillError> {
        let start = Instant::now();
        let attempt = self.perform(request, delivered);
        tokio::pin!(attempt);

        tokio::select! {
            biased;
            _ = user_cancelled(request) => Err(QuillError::Cancelled),
            _ = abort.cancelled() => Err(QuillError::Cancelled),
            _ = tokio::time::sleep(self.config.timeout) => {
                // Cancel wins a cancel/timeout race observed at abort time.
                if request.is_cancelled() {
                    Err(QuillError::Cancelled)
                } else {
                    Err(QuillError::Timeout {
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    })
                }
            }
            result = &mut attempt => result,
        }
    }

    async fn perform(
        &self,
        request: &Request,
        delivered: &AtomicBool,
    ) -> Result<Response, QuillError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(context) = &request.context {
            messages.push(serde_json::json!({
                "role": "system",
                "content": format!("Context: {context}"),
            }));
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": request.prompt,
        }));

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });
        if request.stream {
            body["stream"] = serde_json::Value::Bool(true);
        }

        let mut builder = self.client.post(&self.config.api_endpoint).json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }
        for (name, value) in provider_headers(&self.config.api_endpoint) {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            // Cap error body reads to prevent memory exhaustion.
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            let text = String::from_utf8_lossy(truncated).into_owned();
            return Err(QuillError::from_status(status.as_u16(), text));
        }

        if request.stream {
            self.read_stream(request, response, delivered).await
        } else {
            self.read_complete(request, response).await
        }
    }

    async fn read_complete(
        &self,
        request: &Request,
        response: reqwest::Response,
    ) -> Result<Response, QuillError> {
        let bytes = response.bytes().await.map_err(|e| QuillError::Network {
            details: format!("failed to read response body: {e}"),
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(QuillError::Unknown {
                details: format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    bytes.len()
                ),
            });
        }

        let parsed = parse_completion(&bytes);
        Ok(Response {
            id: request.id.clone(),
            content: parsed.content,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            timestamp: SystemTime::now(),
            tokens_used: parsed.tokens_used,
            finish_reason: parsed.finish_reason,
        })
    }

    /// Decode an SSE-framed body: each `data:` payload carries one JSON
    /// chunk with an incremental delta, terminated by the `[DONE]` sentinel.
    /// Fragments are delivered to `on_stream` synchronously, in arrival
    /// order; a malformed chunk is logged and skipped, never fatal.
    async fn read_stream(
        &self,
        request: &Request,
        response: reqwest::Response,
        delivered: &AtomicBool,
    ) -> Result<Response, QuillError> {
        let mut content = String::new();
        let mut model = None;
        let mut tokens_used = None;
        let mut finish_reason = None;

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| QuillError::Network {
                details: format!("stream read failed: {e}"),
            })?;

            if event.data == "[DONE]" {
                break;
            }

            let chunk: StreamChunk = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(id = %request.id, "skipping malformed stream chunk: {e}");
                    continue;
                }
            };

            // usage / finish_reason / model: last write wins across chunks.
            if let Some(usage) = chunk.usage {
                tokens_used = usage.total_tokens.or(tokens_used);
            }
            if let Some(m) = chunk.model {
                model = Some(m);
            }
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(reason) = choice.finish_reason {
                    finish_reason = Some(reason);
                }
                if let Some(delta) = choice.delta.and_then(|d| d.content) {
                    if !delta.is_empty() {
                        content.push_str(&delta);
                        if let Some(on_stream) = &request.on_stream {
                            on_stream(&delta);
                            delivered.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        Ok(Response {
            id: request.id.clone(),
            content,
            model: model.unwrap_or_else(|| self.config.model.clone()),
            timestamp: SystemTime::now(),
            tokens_used,
            finish_reason,
        })
    }
}

/// Extra headers some providers expect, keyed off the endpoint host.
fn provider_headers(endpoint: &str) -> Vec<(&'static str, &'static str)> {
    if endpoint.contains("openrouter.ai") {
        vec![("HTTP-Referer", "https://quill.md"), ("X-Title", "Quill")]
    } else {
        Vec::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn user_cancelled(request: &Request) {
    match &request.cancel_token {
        Some(token) => token.cancelled_wait().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Response-shape parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    text: Option<String>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct FlatCompletion {
    content: String,
    model: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

struct ParsedCompletion {
    content: String,
    model: Option<String>,
    tokens_used: Option<u64>,
    finish_reason: Option<String>,
}

/// Try the OpenAI choices shape first, then a flat `{content}` shape,
/// defaulting to empty content when neither matches.
fn parse_completion(bytes: &[u8]) -> ParsedCompletion {
    if let Ok(completion) = serde_json::from_slice::<ChatCompletion>(bytes) {
        let model = completion.model;
        let tokens_used = completion.usage.and_then(|u| u.total_tokens);
        let (content, finish_reason) = match completion.choices.into_iter().next() {
            Some(choice) => {
                let content = choice
                    .message
                    .and_then(|m| m.content)
                    .or(choice.text)
                    .unwrap_or_default();
                (content, choice.finish_reason)
            }
            None => (String::new(), None),
        };
        return ParsedCompletion {
            content,
            model,
            tokens_used,
            finish_reason,
        };
    }

    if let Ok(flat) = serde_json::from_slice::<FlatCompletion>(bytes) {
        return ParsedCompletion {
            content: flat.content,
            model: flat.model,
            tokens_used: None,
            finish_reason: None,
        };
    }

    ParsedCompletion {
        content: String::new(),
        model: None,
        tokens_used: None,
        finish_reason: None,
    }
}
