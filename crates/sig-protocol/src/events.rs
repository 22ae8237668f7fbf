use crate::error::ErrorCode;
use crate::transcript::{BatchResult, InsightType, Segment, SessionSnapshotStats};

/// Events a client may send over the duplex channel (spec.md §4.1).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Start {
        sample_rate: u32,
        encoding: String,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        batch_window_sec: Option<f64>,
        #[serde(default)]
        max_batch_window_sec: Option<f64>,
        #[serde(default)]
        enable_insights: Option<bool>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
    },
    Audio {
        chunk: String,
    },
    Stop {},
}

/// Events the gateway emits back to the client (spec.md §4.1).
///
/// Strictly ordered per session by enqueue order; `session_ended` is always
/// last (spec.md §5).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Ready,
    SessionStarted {
        session_id: String,
    },
    Partial {
        text: String,
    },
    BatchProcessed {
        batch_index: u64,
        text: String,
        tokens: usize,
        duration: f64,
    },
    Final {
        text: String,
        segments: Vec<Segment>,
    },
    Insight {
        #[serde(rename = "type")]
        kind: InsightType,
        text: String,
        confidence: f64,
        model: String,
        generated_at: chrono::DateTime<chrono::Utc>,
    },
    FinalSummary {
        transcript: Vec<BatchResult>,
        stats: SessionSnapshotStats,
    },
    SessionEnded {
        session_id: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl OutboundEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundEvent::SessionEnded { .. })
    }
}
