//! Builds the immutable insight payload snapshot from the live transcript
//! (spec.md §4.4 "Payload snapshot").

use sig_insight::mask_pii;
use sig_protocol::{BatchResult, SessionSnapshotStats};

/// Join the most recent batches' text and keep only the last
/// `retain_tokens` whitespace-delimited tokens, PII-masked, so the prompt
/// built from this snapshot is deterministic for a given transcript state.
pub fn build_insight_snapshot(transcript: &[BatchResult], retain_tokens: usize) -> String {
    let joined = transcript
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let masked = mask_pii(&joined);

    let words: Vec<&str> = masked.split_whitespace().collect();
    let start = words.len().saturating_sub(retain_tokens);
    words[start..].join(" ")
}

pub fn final_transcript_text(transcript: &[BatchResult]) -> String {
    transcript
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn session_stats(
    transcript: &[BatchResult],
    insights_emitted: u64,
    insights_dropped: u64,
) -> SessionSnapshotStats {
    SessionSnapshotStats {
        batches: transcript.len() as u64,
        total_audio_seconds: transcript.iter().map(|b| b.duration_seconds).sum(),
        insights_emitted,
        insights_dropped,
    }
}
