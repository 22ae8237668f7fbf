/// Stable error codes surfaced to clients and recorded in metrics labels.
///
/// Every variant maps 1:1 to a taxonomy entry; `code()` is what actually
/// crosses the wire and what `insight_job_failures_total{reason}` uses, so
/// it must never be renamed without a protocol version bump.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("received an event that is invalid in the current session state: {0}")]
    ProtocolError(String),

    #[error("audio chunk exceeds the maximum frame size")]
    PayloadTooLarge,

    #[error("transcription worker unavailable after retries: {0}")]
    WorkerUnavailable(String),

    #[error("transient transcription worker failure: {0}")]
    WorkerTransient(String),

    #[error("insight generation failed: {0}")]
    InsightFailed(String),

    #[error("insight snapshot exceeds the configured context ceiling")]
    ContextTooLarge,

    #[error("drain exceeded the insight flush timeout")]
    InsightFlushTimeout,

    #[error("duplex transport closed unexpectedly")]
    TransportError,
}

impl GatewayError {
    /// The stable string carried on the outbound `error` event and used as
    /// the `reason` label on `insight_job_failures_total`.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::ProtocolError(_) => ErrorCode::ProtocolError,
            GatewayError::PayloadTooLarge => ErrorCode::PayloadTooLarge,
            GatewayError::WorkerUnavailable(_) => ErrorCode::WorkerUnavailable,
            GatewayError::WorkerTransient(_) => ErrorCode::WorkerTransient,
            GatewayError::InsightFailed(_) => ErrorCode::InsightFailed,
            GatewayError::ContextTooLarge => ErrorCode::ContextTooLarge,
            GatewayError::InsightFlushTimeout => ErrorCode::InsightFlushTimeout,
            GatewayError::TransportError => ErrorCode::TransportError,
        }
    }

    /// Whether the session must close after this error (spec.md §7).
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            GatewayError::ProtocolError(_)
                | GatewayError::WorkerUnavailable(_)
                | GatewayError::TransportError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolError,
    PayloadTooLarge,
    WorkerUnavailable,
    WorkerTransient,
    InsightFailed,
    ContextTooLarge,
    InsightFlushTimeout,
    TransportError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::WorkerUnavailable => "worker_unavailable",
            ErrorCode::WorkerTransient => "worker_transient",
            ErrorCode::InsightFailed => "insight_failed",
            ErrorCode::ContextTooLarge => "context_too_large",
            ErrorCode::InsightFlushTimeout => "insight_flush_timeout",
            ErrorCode::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
