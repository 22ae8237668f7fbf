#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<i32>,
}

/// One flushed audio window transcribed by a worker (spec.md §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BatchResult {
    pub batch_index: u64,
    pub text: String,
    pub segments: Vec<Segment>,
    pub duration_seconds: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    LiveSummary,
    Alert,
    Suggestion,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InsightEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: InsightType,
    pub text: String,
    pub confidence: f64,
    pub model: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl InsightEvent {
    /// Confidence must land in `[0, 1]` (spec.md §4.4 response validation).
    pub fn clamp_confidence(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshotStats {
    pub batches: u64,
    pub total_audio_seconds: f64,
    pub insights_emitted: u64,
    pub insights_dropped: u64,
}
