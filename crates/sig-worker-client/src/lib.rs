//! HTTP client for the stateless transcription worker fleet (spec.md §4.5).
//!
//! The external load balancer, not this client, is responsible for routing
//! by `X-Session-Affinity`. When a call fails in a way that looks like the
//! bound worker is gone, the client retries once without the affinity
//! header and records the break as a counter rather than an error, per
//! spec.md's "metric-only" decision on affinity breaks.

use std::cell::Cell;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use sig_protocol::{BatchResult, Segment};

mod response;

pub use response::WorkerResponse;

const AFFINITY_HEADER: &str = "X-Session-Affinity";
const MIN_TIMEOUT_SECS: f64 = 30.0;
const TIMEOUT_REALTIME_FACTOR: f64 = 6.0;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker request failed: {0}")]
    Transport(String),
    #[error("worker returned server error: status {0}")]
    ServerError(u16),
    #[error("worker returned client error: status {0}")]
    ClientError(u16),
    #[error("worker response could not be parsed: {0}")]
    Malformed(String),
}

impl WorkerError {
    fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Transport(_) | WorkerError::ServerError(_))
    }

    fn looks_like_unreachable(&self) -> bool {
        matches!(self, WorkerError::Transport(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (spec.md §4.3: "up to 2
    /// additional attempts").
    pub retries: usize,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_base_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscribeRequest<'a> {
    pub wav_bytes: Vec<u8>,
    pub language: Option<&'a str>,
    pub model: &'a str,
    pub compute_type: &'a str,
    pub session_affinity: &'a str,
    pub audio_duration_seconds: f64,
}

pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
    retry_policy: RetryPolicy,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn timeout_for(duration_seconds: f64) -> Duration {
        let secs = MIN_TIMEOUT_SECS.max(duration_seconds * TIMEOUT_REALTIME_FACTOR);
        Duration::from_secs_f64(secs)
    }

    /// POST the WAV blob and return the parsed [`BatchResult`], retrying
    /// transient failures with exponential backoff + jitter before giving
    /// up. `next_batch_index` is assigned by the caller (the flusher),
    /// since that is where `batch_index` monotonicity is owned.
    pub async fn transcribe(
        &self,
        req: TranscribeRequest<'_>,
        next_batch_index: u64,
    ) -> Result<(BatchResult, bool), WorkerError> {
        let timeout = Self::timeout_for(req.audio_duration_seconds);
        let started_at = chrono::Utc::now();

        let backoff = ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(self.retry_policy.backoff_base_ms))
            .with_factor(2.0)
            .with_max_times(self.retry_policy.retries);

        let use_affinity = Cell::new(true);
        let affinity_broken = Cell::new(false);

        let response = (|| async {
            let with_affinity = use_affinity.get();
            self.send_once(&req, timeout, with_affinity).await
        })
        .retry(backoff)
        .when(|e: &WorkerError| e.is_retryable())
        .notify(|e: &WorkerError, _dur: Duration| {
            if use_affinity.get() && e.looks_like_unreachable() {
                use_affinity.set(false);
                affinity_broken.set(true);
            }
        })
        .await?;
        let affinity_broken = affinity_broken.get();

        let completed_at = chrono::Utc::now();
        let batch_result = BatchResult {
            batch_index: next_batch_index,
            text: response.text,
            segments: response
                .segments
                .into_iter()
                .map(|s| Segment {
                    start: s.start,
                    end: s.end,
                    text: s.text,
                    speaker: s.speaker,
                })
                .collect(),
            duration_seconds: response.duration_seconds,
            started_at,
            completed_at,
        };

        Ok((batch_result, affinity_broken))
    }

    async fn send_once(
        &self,
        req: &TranscribeRequest<'_>,
        timeout: Duration,
        with_affinity: bool,
    ) -> Result<WorkerResponse, WorkerError> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(req.wav_bytes.clone())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| WorkerError::Transport(e.to_string()))?,
            )
            .text("language", req.language.unwrap_or("").to_string())
            .text("model", req.model.to_string())
            .text("compute_type", req.compute_type.to_string());

        let mut builder = self
            .http
            .post(format!("{}/transcribe", self.base_url))
            .timeout(timeout)
            .multipart(form);

        if with_affinity {
            builder = builder.header(AFFINITY_HEADER, req.session_affinity);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| WorkerError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(WorkerError::ServerError(status.as_u16()));
        }
        if status.is_client_error() {
            return Err(WorkerError::ClientError(status.as_u16()));
        }

        let body: WorkerResponse = resp
            .json()
            .await
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request(affinity: &str) -> TranscribeRequest<'_> {
        TranscribeRequest {
            wav_bytes: vec![0u8; 44],
            language: Some("pt"),
            model: "default",
            compute_type: "float16",
            session_affinity: affinity,
            audio_duration_seconds: 2.0,
        }
    }

    #[tokio::test]
    async fn successful_transcription_assigns_batch_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "hello world",
                "segments": [{"start": 0.0, "end": 1.0, "text": "hello world"}],
                "language": "pt",
                "duration_seconds": 2.0,
            })))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri());
        let (result, broken) = client
            .transcribe(sample_request("session-1"), 3)
            .await
            .unwrap();

        assert_eq!(result.batch_index, 3);
        assert_eq!(result.text, "hello world");
        assert!(!broken);
    }

    #[tokio::test]
    async fn transient_5xx_is_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "recovered",
                "segments": [],
                "language": "en",
                "duration_seconds": 1.0,
            })))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).with_retry_policy(RetryPolicy {
            retries: 2,
            backoff_base_ms: 1,
        });
        let (result, _) = client
            .transcribe(sample_request("session-2"), 0)
            .await
            .unwrap();
        assert_eq!(result.text, "recovered");
    }

    #[tokio::test]
    async fn persistent_5xx_exhausts_retries_and_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).with_retry_policy(RetryPolicy {
            retries: 2,
            backoff_base_ms: 1,
        });
        let err = client
            .transcribe(sample_request("session-3"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ServerError(500)));
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri());
        let err = client
            .transcribe(sample_request("session-4"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ClientError(400)));
    }

    #[test]
    fn timeout_scales_with_audio_duration() {
        assert_eq!(WorkerClient::timeout_for(1.0), Duration::from_secs(30));
        assert_eq!(WorkerClient::timeout_for(10.0), Duration::from_secs(60));
    }
}
