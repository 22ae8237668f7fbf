//! Backpressure policy for the session's outbound event channel
//! (spec.md §5 "Backpressure policy").
//!
//! Audio ingest never blocks on a congested client. `Partial` and
//! `BatchProcessed` events are best-effort: if the bounded channel is
//! full, they are dropped and logged. `Insight`, `Error`, and every
//! terminal/session-lifecycle event are guaranteed delivery and may make
//! the sender wait for room.

use sig_protocol::OutboundEvent;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct OutboundSink {
    session_id: String,
    tx: mpsc::Sender<OutboundEvent>,
}

impl OutboundSink {
    pub fn new(session_id: String, tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn sender(&self) -> mpsc::Sender<OutboundEvent> {
        self.tx.clone()
    }

    /// Send an event that must never be dropped: `insight`, `error`, and
    /// every state-transition event up to and including `session_ended`.
    pub async fn send_guaranteed(&self, event: OutboundEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::warn!(session_id = %self.session_id, "outbound_channel_closed");
        }
    }

    /// Send an event that may be dropped under backpressure: `partial` and
    /// `batch_processed`. Never awaits — a full channel drops the event
    /// immediately rather than stalling audio ingest.
    pub fn send_droppable(&self, event: OutboundEvent) {
        if let Err(err) = self.tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(dropped) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        event = ?event_kind(&dropped),
                        "outbound_channel_full_dropping_event"
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!(session_id = %self.session_id, "outbound_channel_closed");
                }
            }
        }
    }
}

fn event_kind(event: &OutboundEvent) -> &'static str {
    match event {
        OutboundEvent::Ready => "ready",
        OutboundEvent::SessionStarted { .. } => "session_started",
        OutboundEvent::Partial { .. } => "partial",
        OutboundEvent::BatchProcessed { .. } => "batch_processed",
        OutboundEvent::Final { .. } => "final",
        OutboundEvent::Insight { .. } => "insight",
        OutboundEvent::FinalSummary { .. } => "final_summary",
        OutboundEvent::SessionEnded { .. } => "session_ended",
        OutboundEvent::Error { .. } => "error",
    }
}
