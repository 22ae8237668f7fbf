use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sig_protocol::OutboundEvent;

/// A unit of work submitted by a session when a batch's transcript looks
/// worth summarizing. Holds only a weak sender back to the session so an
/// insight job never keeps a closed session's channel alive (spec.md §9).
#[derive(Clone)]
pub struct InsightJob {
    pub session_id: String,
    pub tenant_id: Option<String>,
    /// The retained-token transcript snapshot the prompt is built from,
    /// already passed through [`crate::masking::mask_pii`].
    pub snapshot_text: String,
    pub requested_at: DateTime<Utc>,
    pub reply: tokio::sync::mpsc::WeakSender<OutboundEvent>,
    /// Shared with the session's `insights_emitted` stat: incremented once
    /// per job that actually produces an `InsightEvent`, as opposed to
    /// every trigger that merely gets queued or coalesced.
    pub emitted: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    Coalesced,
    RerunRequested,
    SkippedTooShort,
    Throttled,
    QueueFull,
    ManagerShuttingDown,
}

pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}
