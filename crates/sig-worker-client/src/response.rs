/// Shape returned by `POST /transcribe` (spec.md §6).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkerResponse {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<WorkerSegment>,
    #[serde(default)]
    pub language: Option<String>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkerSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<i32>,
}
