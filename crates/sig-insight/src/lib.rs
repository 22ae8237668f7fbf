//! Bounded, backpressure-aware insight job queue (spec.md §4.4).
//!
//! Sessions submit [`InsightJob`]s; a fixed pool of workers drains them
//! through a [`sig_chat_client::ChatClient`]. Throttling, coalescing and the
//! per-tenant cap all happen before a job ever reaches a worker, so the
//! worker pool itself stays a dumb dispatch loop.

mod job;
mod masking;
mod metrics;

pub use job::{InsightJob, SubmitOutcome};
pub use masking::mask_pii;
pub use metrics::{InsightMetricsSink, NoopMetricsSink};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sig_chat_client::{ChatClient, ChatMessage};
use sig_protocol::{InsightEvent, InsightType, OutboundEvent};
use tokio::sync::{mpsc, Semaphore};

use job::estimate_tokens;

#[derive(Debug, Clone)]
pub struct InsightManagerConfig {
    pub queue_capacity: usize,
    pub worker_concurrency: usize,
    pub min_tokens: usize,
    pub min_interval: Duration,
    pub per_tenant_max: usize,
    pub retain_tokens: usize,
    pub flush_timeout: Duration,
}

impl Default for InsightManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            worker_concurrency: 32,
            min_tokens: 10,
            min_interval: Duration::from_secs(10),
            per_tenant_max: 5,
            retain_tokens: 60,
            flush_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<String, InsightJob>>,
    in_flight: Mutex<HashSet<String>>,
    rerun_requested: Mutex<HashSet<String>>,
    last_run: Mutex<HashMap<String, Instant>>,
    tenant_in_flight: Mutex<HashMap<String, usize>>,
}

pub struct InsightManager {
    config: InsightManagerConfig,
    signal_tx: mpsc::Sender<String>,
    shared: Arc<Shared>,
    metrics: Arc<dyn InsightMetricsSink>,
}

impl InsightManager {
    pub fn spawn(
        config: InsightManagerConfig,
        chat: Arc<ChatClient>,
        metrics: Arc<dyn InsightMetricsSink>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared::default());
        let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));

        tokio::spawn(dispatch_loop(
            signal_rx,
            shared.clone(),
            semaphore,
            config.clone(),
            chat,
            metrics.clone(),
            signal_tx.clone(),
        ));

        Self {
            config,
            signal_tx,
            shared,
            metrics,
        }
    }

    /// Enqueue, coalesce into, or throttle-drop a job. Never blocks: a full
    /// signal queue is reported as [`SubmitOutcome::QueueFull`] rather than
    /// applying backpressure to the calling session actor.
    pub fn submit(&self, job: InsightJob) -> SubmitOutcome {
        if estimate_tokens(&job.snapshot_text) < self.config.min_tokens {
            return SubmitOutcome::SkippedTooShort;
        }

        {
            let last_run = self.shared.last_run.lock().unwrap();
            if let Some(at) = last_run.get(&job.session_id) {
                if at.elapsed() < self.config.min_interval {
                    return SubmitOutcome::Throttled;
                }
            }
        }

        let already_in_flight = self
            .shared
            .in_flight
            .lock()
            .unwrap()
            .contains(&job.session_id);

        let already_pending = {
            let mut pending = self.shared.pending.lock().unwrap();
            let replaced = pending.insert(job.session_id.clone(), job.clone()).is_some();
            self.metrics.record_queue_size(pending.len());
            replaced
        };

        if already_in_flight {
            self.shared
                .rerun_requested
                .lock()
                .unwrap()
                .insert(job.session_id.clone());
            return SubmitOutcome::RerunRequested;
        }

        if already_pending {
            return SubmitOutcome::Coalesced;
        }

        match self.signal_tx.try_send(job.session_id.clone()) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let mut pending = self.shared.pending.lock().unwrap();
                pending.remove(&job.session_id);
                self.metrics.record_queue_size(pending.len());
                SubmitOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitOutcome::ManagerShuttingDown,
        }
    }

    /// Drops this session's still-queued job (if any) and waits up to
    /// `INSIGHT_FLUSH_TIMEOUT` for its in-flight job (if any) to finish, for
    /// that session's drain. Scoped to `session_id` only: other sessions'
    /// pending/in-flight jobs are left untouched (spec.md §4.4 Cancellation,
    /// §5 cross-session isolation). Returns the number of jobs (0 or 1)
    /// dropped unfinished for this session.
    pub async fn drain(&self, session_id: &str, timeout: Duration) -> usize {
        let dropped_pending = {
            let mut pending = self.shared.pending.lock().unwrap();
            let had_pending = pending.remove(session_id).is_some();
            self.metrics.record_queue_size(pending.len());
            had_pending as usize
        };
        self.shared.rerun_requested.lock().unwrap().remove(session_id);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.shared.in_flight.lock().unwrap().contains(session_id) {
                return dropped_pending;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(session_id, "insight_drain_timed_out");
                return dropped_pending + 1;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn dispatch_loop(
    mut signal_rx: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    config: InsightManagerConfig,
    chat: Arc<ChatClient>,
    metrics: Arc<dyn InsightMetricsSink>,
    signal_tx: mpsc::Sender<String>,
) {
    while let Some(session_id) = signal_rx.recv().await {
        let job = {
            let mut pending = shared.pending.lock().unwrap();
            let job = pending.remove(&session_id);
            metrics.record_queue_size(pending.len());
            job
        };
        let Some(job) = job else { continue };

        if let Some(tenant_id) = &job.tenant_id {
            let mut tenant_in_flight = shared.tenant_in_flight.lock().unwrap();
            let count = tenant_in_flight.entry(tenant_id.clone()).or_insert(0);
            if *count >= config.per_tenant_max {
                metrics.record_failure("tenant_cap");
                continue;
            }
            *count += 1;
        }

        shared.in_flight.lock().unwrap().insert(session_id.clone());
        metrics.record_wait_seconds((chrono::Utc::now() - job.requested_at).num_milliseconds() as f64 / 1000.0);

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        tokio::spawn(run_job(
            job,
            permit,
            shared.clone(),
            config.clone(),
            chat.clone(),
            metrics.clone(),
            signal_tx.clone(),
        ));
    }
}

async fn run_job(
    job: InsightJob,
    permit: tokio::sync::OwnedSemaphorePermit,
    shared: Arc<Shared>,
    config: InsightManagerConfig,
    chat: Arc<ChatClient>,
    metrics: Arc<dyn InsightMetricsSink>,
    signal_tx: mpsc::Sender<String>,
) {
    let _permit = permit;
    let started = Instant::now();

    let result = generate_insight(&chat, &job, config.flush_timeout).await;

    match result {
        Ok(event) => {
            job.emitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if let Some(sender) = job.reply.upgrade() {
                let _ = sender
                    .send(OutboundEvent::Insight {
                        kind: event.kind,
                        text: event.text,
                        confidence: event.confidence,
                        model: event.model,
                        generated_at: event.generated_at,
                    })
                    .await;
            }
        }
        Err(reason) => {
            tracing::warn!(session_id = %job.session_id, error = %reason, "insight_job_failed");
            metrics.record_failure(reason);
        }
    }

    metrics.record_job_duration_seconds(started.elapsed().as_secs_f64());

    shared.last_run.lock().unwrap().insert(job.session_id.clone(), Instant::now());
    shared.in_flight.lock().unwrap().remove(&job.session_id);
    if let Some(tenant_id) = &job.tenant_id {
        let mut tenant_in_flight = shared.tenant_in_flight.lock().unwrap();
        if let Some(count) = tenant_in_flight.get_mut(tenant_id) {
            *count = count.saturating_sub(1);
        }
    }

    let rerun = shared.rerun_requested.lock().unwrap().remove(&job.session_id);
    if rerun && shared.pending.lock().unwrap().contains_key(&job.session_id) {
        // the coalesced snapshot is still waiting in `pending`; re-signal
        // the dispatcher now that this session is no longer in_flight,
        // rather than stranding it until an unrelated submit() arrives.
        if let Err(err) = signal_tx.try_send(job.session_id.clone()) {
            tracing::debug!(
                session_id = %job.session_id,
                error = %err,
                "insight_rerun_resignal_failed"
            );
        }
    }
}

async fn generate_insight(
    chat: &ChatClient,
    job: &InsightJob,
    deadline: Duration,
) -> Result<InsightEvent, &'static str> {
    let messages = vec![
        ChatMessage::system(
            "You summarize live call-center transcripts into a short insight. \
             Reply with a JSON object: {\"type\": one of live_summary|alert|suggestion, \
             \"text\": string, \"confidence\": number between 0 and 1}.",
        ),
        ChatMessage::user(job.snapshot_text.clone()),
    ];

    let backend = chat
        .backend_for_prompt_tokens(estimate_tokens(&job.snapshot_text) as u32)
        .map_err(|_| "context_too_large")?;

    let value = chat
        .complete_structured(&messages, backend, 256, 0.2, deadline)
        .await
        .map_err(|_| "chat_backend_error")?;

    let kind = match value.get("type").and_then(|v| v.as_str()) {
        Some("alert") => InsightType::Alert,
        Some("suggestion") => InsightType::Suggestion,
        _ => InsightType::LiveSummary,
    };
    let text = value
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or("malformed_insight_payload")?
        .to_string();
    let confidence = value.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5);

    let event = InsightEvent {
        session_id: job.session_id.clone(),
        kind,
        text,
        confidence,
        model: "insight-model".to_string(),
        generated_at: chrono::Utc::now(),
    }
    .clamp_confidence();
    Ok(event)
}
