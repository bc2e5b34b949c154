use std::str;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::{classify_status, RetryPolicy, JITTER_RANGE};
use crate::{GenerateError, GenerationBackend, TaskHandle, TaskOutcome, WorkerEvent};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434/api/generate";
pub const DEFAULT_MODEL: &str = "llama3.2:latest";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub endpoint: String,
    pub model: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Backend speaking the Ollama generate protocol: POST
/// `{model, prompt, stream: true}`, newline-delimited JSON records
/// `{response, done}` back.
pub struct OllamaBackend {
    config: Arc<BackendConfig>,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: BackendConfig) -> anyhow::Result<Self> {
        // Connect and idle-read timeouts, not a total deadline: a healthy
        // stream may take longer than 20s end to end.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .read_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }
}

impl GenerationBackend for OllamaBackend {
    fn start(&self, prompt: String) -> TaskHandle {
        let (events, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let worker = Worker {
            client: self.client.clone(),
            config: self.config.clone(),
            prompt,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run());
        TaskHandle::from_parts(rx, cancel)
    }
}

#[derive(Debug, Deserialize, Default)]
struct GenerateRecord {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

enum StreamAbort {
    Cancelled,
    Failed(GenerateError),
}

struct Worker {
    client: reqwest::Client,
    config: Arc<BackendConfig>,
    prompt: String,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let outcome = self.generate().await;
        let _ = self.events.send(WorkerEvent::Finished(outcome)).await;
    }

    async fn generate(&self) -> TaskOutcome {
        let mut attempt: u32 = 0;
        let mut delivered = false;
        loop {
            if self.cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            let error = match self.stream_once(&mut delivered).await {
                Ok(()) => return TaskOutcome::Ok,
                Err(StreamAbort::Cancelled) => return TaskOutcome::Cancelled,
                Err(StreamAbort::Failed(error)) => error,
            };
            // A retry restarts the request from scratch; once output reached
            // the consumer that would duplicate chunks, so the error surfaces
            // instead.
            if delivered || !self.config.retry.should_retry(attempt, &error) {
                warn!(%error, attempt, "generate request failed");
                return TaskOutcome::Error(error.to_string());
            }
            let jitter = rand::thread_rng().gen_range(0.0..JITTER_RANGE);
            let delay = self.config.retry.backoff_delay(attempt, &error, jitter);
            debug!(
                %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying generate request"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn stream_once(&self, delivered: &mut bool) -> Result<(), StreamAbort> {
        let payload = json!({
            "model": self.config.model,
            "prompt": self.prompt,
            "stream": true,
        });
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| StreamAbort::Failed(transport_error(&err)))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        if let Some(error) = classify_status(status.as_u16(), retry_after.as_deref()) {
            return Err(StreamAbort::Failed(error));
        }

        let records = record_stream(response);
        tokio::pin!(records);
        while let Some(record) = records.next().await {
            if self.cancel.is_cancelled() {
                return Err(StreamAbort::Cancelled);
            }
            let record = record.map_err(StreamAbort::Failed)?;
            if let Some(message) = record.error {
                return Err(StreamAbort::Failed(GenerateError::Fatal(message)));
            }
            if !record.response.is_empty() {
                *delivered = true;
                if self
                    .events
                    .send(WorkerEvent::Chunk(record.response))
                    .await
                    .is_err()
                {
                    // Consumer dropped the handle; nothing left to deliver to.
                    return Err(StreamAbort::Cancelled);
                }
            }
            if record.done {
                break;
            }
        }
        Ok(())
    }
}

// Decode the NDJSON body into records. Malformed lines are skipped; a
// transport failure mid-body is a transient error.
fn record_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<GenerateRecord, GenerateError>> {
    let mut bytes = response.bytes_stream();
    stream! {
        let mut buffer = String::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(GenerateError::Transient(format!("stream read failed: {err}")));
                    return;
                }
            };
            buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer = buffer[pos + 1..].to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<GenerateRecord>(&line) {
                    Ok(record) => yield Ok(record),
                    Err(err) => debug!(%err, "skipping malformed stream line"),
                }
            }
        }
        let tail = buffer.trim();
        if !tail.is_empty() {
            if let Ok(record) = serde_json::from_str::<GenerateRecord>(tail) {
                yield Ok(record);
            }
        }
    }
}

fn transport_error(err: &reqwest::Error) -> GenerateError {
    if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() {
        GenerateError::Transient(err.to_string())
    } else {
        GenerateError::Fatal(err.to_string())
    }
}
