#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    Pcm16,
}

/// Per-session tunables, parsed from the `start` event and clamped against
/// the process defaults (spec.md §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    #[serde(default)]
    pub language: Option<String>,
    pub batch_window_sec: f64,
    pub max_batch_window_sec: f64,
    pub max_buffer_sec: f64,
    #[serde(default)]
    pub enable_insights: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl SessionConfig {
    /// Clamp ranges from spec.md §3: `batch_window_sec` in `[0.5, 15]`,
    /// `max_batch_window_sec` in `[batch_window_sec, 20]`, `max_buffer_sec`
    /// at least `max_batch_window_sec`.
    pub fn clamp(&mut self) {
        self.batch_window_sec = self.batch_window_sec.clamp(0.5, 15.0);
        self.max_batch_window_sec = self
            .max_batch_window_sec
            .clamp(self.batch_window_sec, 20.0);
        self.max_buffer_sec = self.max_buffer_sec.max(self.max_batch_window_sec);
    }

    pub fn bytes_per_sample(&self) -> u32 {
        match self.encoding {
            AudioEncoding::Pcm16 => 2,
        }
    }
}
