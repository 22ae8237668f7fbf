//! The Session Coordinator (spec.md §4.1): one actor per live connection,
//! owning the audio buffer, the batch flusher's flush decisions, and the
//! state machine `Opening -> Running -> Draining -> Closed`.
//!
//! Flushes run to completion inside [`Actor::handle`], which ractor already
//! processes one message at a time per actor. That sequencing is what
//! spec.md §4.3 means by "the flusher is strictly sequential per session":
//! no audio-append message is handled while a flush is in flight, so
//! `batch_index` assignment never races itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use sig_audio::{to_wav, AudioBuffer};
use sig_insight::{InsightJob, InsightManager, SubmitOutcome};
use sig_metrics::{BatchStatus, GatewayMetrics};
use sig_protocol::{
    AudioEncoding, ErrorCode, GatewayError, InboundEvent, OutboundEvent, SessionConfig,
};
use sig_worker_client::{TranscribeRequest, WorkerClient, WorkerError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::outbound::OutboundSink;
use crate::snapshot::{build_insight_snapshot, final_transcript_text, session_stats};

/// Defaults applied when the `start` event omits a field, before clamping
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub batch_window_sec: f64,
    pub max_batch_window_sec: f64,
    pub max_buffer_sec: f64,
    pub worker_model: String,
    pub worker_compute_type: String,
    pub insight_retain_tokens: usize,
    pub insight_flush_timeout: Duration,
}

pub struct SessionArgs {
    pub session_id: String,
    pub outbound: mpsc::Sender<OutboundEvent>,
    pub worker: Arc<WorkerClient>,
    pub insight_manager: Option<Arc<InsightManager>>,
    pub metrics: Arc<GatewayMetrics>,
    pub defaults: SessionDefaults,
}

pub enum SessionMsg {
    Inbound(InboundEvent),
    FlushTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Running,
    Draining,
    Closed,
}

struct RunningState {
    config: SessionConfig,
    audio: AudioBuffer,
    transcript: Vec<sig_protocol::BatchResult>,
    next_batch_index: u64,
    last_flush_at: Instant,
    /// Shared with every `InsightJob` this session constructs; incremented
    /// by the insight manager's worker only when a job actually produces an
    /// `InsightEvent`, not when it's merely queued or coalesced.
    insights_emitted: Arc<AtomicU64>,
    insights_dropped: u64,
}

pub struct SessionState {
    session_id: String,
    outbound: OutboundSink,
    worker: Arc<WorkerClient>,
    insight_manager: Option<Arc<InsightManager>>,
    metrics: Arc<GatewayMetrics>,
    defaults: SessionDefaults,
    phase: Phase,
    running: Option<RunningState>,
    flush_timer: Option<JoinHandle<()>>,
}

pub struct SessionActor;

#[ractor::async_trait]
impl Actor for SessionActor {
    type Msg = SessionMsg;
    type State = SessionState;
    type Arguments = SessionArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(SessionState {
            session_id: args.session_id.clone(),
            outbound: OutboundSink::new(args.session_id, args.outbound),
            worker: args.worker,
            insight_manager: args.insight_manager,
            metrics: args.metrics,
            defaults: args.defaults,
            phase: Phase::Opening,
            running: None,
            flush_timer: None,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMsg::Inbound(event) => handle_inbound(&myself, state, event).await,
            SessionMsg::FlushTick => handle_flush_tick(&myself, state).await,
        }
        Ok(())
    }
}

async fn handle_inbound(myself: &ActorRef<SessionMsg>, state: &mut SessionState, event: InboundEvent) {
    match (state.phase, event) {
        (Phase::Opening, InboundEvent::Start { sample_rate, encoding, language, batch_window_sec, max_batch_window_sec, enable_insights, provider, tenant_id }) => {
            handle_start(
                myself,
                state,
                sample_rate,
                encoding,
                language,
                batch_window_sec,
                max_batch_window_sec,
                enable_insights,
                provider,
                tenant_id,
            )
            .await;
        }
        (Phase::Running, InboundEvent::Audio { chunk }) => {
            handle_audio(myself, state, chunk).await;
        }
        (Phase::Running, InboundEvent::Stop {}) => {
            handle_stop(myself, state).await;
        }
        (Phase::Draining, InboundEvent::Stop {}) | (Phase::Closed, InboundEvent::Stop {}) => {
            // idempotent: a second `stop` is ignored (spec.md §8).
        }
        (phase, _) => {
            if phase != Phase::Closed {
                fail_session(
                    state,
                    GatewayError::ProtocolError("event not valid in current session state".into()),
                )
                .await;
                myself.stop(Some("protocol_error".to_string()));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_start(
    myself: &ActorRef<SessionMsg>,
    state: &mut SessionState,
    sample_rate: u32,
    encoding: String,
    language: Option<String>,
    batch_window_sec: Option<f64>,
    max_batch_window_sec: Option<f64>,
    enable_insights: Option<bool>,
    provider: Option<String>,
    tenant_id: Option<String>,
) {
    if encoding != "pcm16" {
        fail_session(
            state,
            GatewayError::ProtocolError(format!("unsupported encoding {encoding:?}")),
        )
        .await;
        myself.stop(Some("protocol_error".to_string()));
        return;
    }

    let mut config = SessionConfig {
        sample_rate,
        encoding: AudioEncoding::Pcm16,
        language,
        batch_window_sec: batch_window_sec.unwrap_or(state.defaults.batch_window_sec),
        max_batch_window_sec: max_batch_window_sec.unwrap_or(state.defaults.max_batch_window_sec),
        max_buffer_sec: state.defaults.max_buffer_sec,
        enable_insights: enable_insights.unwrap_or(false),
        provider,
        tenant_id,
    };
    config.clamp();

    state.running = Some(RunningState {
        audio: AudioBuffer::new(config.sample_rate),
        config,
        transcript: Vec::new(),
        next_batch_index: 0,
        last_flush_at: Instant::now(),
        insights_emitted: Arc::new(AtomicU64::new(0)),
        insights_dropped: 0,
    });
    state.phase = Phase::Running;

    state.outbound.send_guaranteed(OutboundEvent::Ready).await;
    state
        .outbound
        .send_guaranteed(OutboundEvent::SessionStarted {
            session_id: state.session_id.clone(),
        })
        .await;
}

const MAX_CHUNK_BASE64_BYTES: usize = 1024 * 1024;
const STOP_FLUSH_MIN_SECONDS: f64 = 0.1;

async fn handle_audio(myself: &ActorRef<SessionMsg>, state: &mut SessionState, chunk: String) {
    if chunk.len() > MAX_CHUNK_BASE64_BYTES {
        state
            .outbound
            .send_guaranteed(OutboundEvent::Error {
                code: ErrorCode::PayloadTooLarge,
                message: "audio chunk exceeds the maximum frame size".to_string(),
            })
            .await;
        return;
    }

    let pcm = match base64::engine::general_purpose::STANDARD.decode(chunk.as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            fail_session(
                state,
                GatewayError::ProtocolError(format!("invalid base64 audio chunk: {err}")),
            )
            .await;
            myself.stop(Some("protocol_error".to_string()));
            return;
        }
    };

    if let Some(timer) = state.flush_timer.take() {
        timer.abort();
    }

    let Some(running) = state.running.as_mut() else {
        return;
    };
    running.audio.append(&pcm);

    // Trigger 4: a hard buffer breach forces a synchronous partial flush
    // before the append is considered "complete" (spec.md §4.2).
    if running.audio.buffered_duration_seconds() >= running.config.max_buffer_sec {
        let max_batch_window = running.config.max_batch_window_sec;
        do_flush(state, Some(max_batch_window)).await;
        if bail_if_closed(myself, state) {
            return;
        }
    }

    let Some(running) = state.running.as_ref() else {
        return;
    };
    let buffered = running.audio.buffered_duration_seconds();

    // Trigger 2: the hard cadence cap, regardless of elapsed time.
    if buffered >= running.config.max_batch_window_sec {
        do_flush(state, None).await;
        bail_if_closed(myself, state);
        return;
    }

    // Trigger 1: the soft cadence cap, once elapsed time also clears it.
    if buffered >= running.config.batch_window_sec {
        let batch_window = running.config.batch_window_sec;
        let elapsed = running.last_flush_at.elapsed();
        if elapsed >= Duration::from_secs_f64(batch_window) {
            do_flush(state, None).await;
            bail_if_closed(myself, state);
            return;
        }
        arm_flush_timer(myself, state, batch_window, elapsed);
    }
}

fn bail_if_closed(myself: &ActorRef<SessionMsg>, state: &SessionState) -> bool {
    if state.phase == Phase::Closed {
        myself.stop(Some("worker_unavailable".to_string()));
        true
    } else {
        false
    }
}

fn arm_flush_timer(myself: &ActorRef<SessionMsg>, state: &mut SessionState, batch_window_sec: f64, elapsed: Duration) {
    let remaining = Duration::from_secs_f64(batch_window_sec.max(0.0)).saturating_sub(elapsed);
    let myself = myself.clone();
    state.flush_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(remaining).await;
        let _ = myself.cast(SessionMsg::FlushTick);
    }));
}

async fn handle_flush_tick(myself: &ActorRef<SessionMsg>, state: &mut SessionState) {
    state.flush_timer = None;
    if state.phase != Phase::Running {
        return;
    }
    let Some(running) = &state.running else { return };
    if running.audio.buffered_duration_seconds() >= running.config.batch_window_sec {
        do_flush(state, None).await;
        bail_if_closed(myself, state);
    }
}

async fn handle_stop(myself: &ActorRef<SessionMsg>, state: &mut SessionState) {
    if let Some(timer) = state.flush_timer.take() {
        timer.abort();
    }

    let has_remaining = state
        .running
        .as_ref()
        .map(|r| r.audio.buffered_duration_seconds() >= STOP_FLUSH_MIN_SECONDS)
        .unwrap_or(false);
    if has_remaining {
        do_flush(state, None).await;
        if state.phase == Phase::Closed {
            myself.stop(Some("worker_unavailable".to_string()));
            return;
        }
    }

    state.phase = Phase::Draining;

    let Some(running) = &state.running else {
        finish_draining(state).await;
        myself.stop(None);
        return;
    };

    let full_text = final_transcript_text(&running.transcript);
    let segments = running
        .transcript
        .iter()
        .flat_map(|b| b.segments.clone())
        .collect();
    state
        .outbound
        .send_guaranteed(OutboundEvent::Final {
            text: full_text,
            segments,
        })
        .await;

    if let Some(manager) = state.insight_manager.clone() {
        let dropped = manager
            .drain(&state.session_id, state.defaults.insight_flush_timeout)
            .await;
        if dropped > 0 {
            state
                .outbound
                .send_guaranteed(OutboundEvent::Error {
                    code: ErrorCode::InsightFlushTimeout,
                    message: format!("{dropped} insight job(s) discarded at drain"),
                })
                .await;
        }
    }

    finish_draining(state).await;
    myself.stop(None);
}

async fn finish_draining(state: &mut SessionState) {
    state.phase = Phase::Closed;
    if let Some(running) = state.running.take() {
        let stats = session_stats(
            &running.transcript,
            running.insights_emitted.load(Ordering::Relaxed),
            running.insights_dropped,
        );
        state
            .outbound
            .send_guaranteed(OutboundEvent::FinalSummary {
                transcript: running.transcript,
                stats,
            })
            .await;
    }
    state
        .outbound
        .send_guaranteed(OutboundEvent::SessionEnded {
            session_id: state.session_id.clone(),
        })
        .await;
}

async fn fail_session(state: &mut SessionState, error: GatewayError) {
    state
        .outbound
        .send_guaranteed(OutboundEvent::Error {
            code: error.code(),
            message: error.to_string(),
        })
        .await;
    state
        .outbound
        .send_guaranteed(OutboundEvent::SessionEnded {
            session_id: state.session_id.clone(),
        })
        .await;
    state.phase = Phase::Closed;
    state.running = None;
}

/// Flushes the buffer (or the oldest `max_seconds` of it), transcribes it,
/// appends the result to the transcript, and notifies the insight manager.
/// On persistent worker failure the session is failed fatally and the
/// transcript is left consistent up to `batch_index - 1` (spec.md §4.3).
async fn do_flush(state: &mut SessionState, max_seconds: Option<f64>) {
    let Some(running) = state.running.as_mut() else {
        return;
    };
    let Some(snapshot) = running.audio.snapshot_and_advance(max_seconds) else {
        return;
    };

    let wav = match to_wav(&snapshot.pcm, running.audio.sample_rate()) {
        Ok(bytes) => bytes,
        Err(err) => {
            fail_session(state, GatewayError::WorkerUnavailable(err.to_string())).await;
            return;
        }
    };

    let running = state.running.as_ref().expect("checked above");
    let next_index = running.next_batch_index;
    let req = TranscribeRequest {
        wav_bytes: wav,
        language: running.config.language.as_deref(),
        model: &state.defaults.worker_model,
        compute_type: &state.defaults.worker_compute_type,
        session_affinity: &state.session_id,
        audio_duration_seconds: snapshot.duration_seconds,
    };

    match state.worker.transcribe(req, next_index).await {
        Ok((batch_result, affinity_broken)) => {
            if affinity_broken {
                state.metrics.record_affinity_break();
            }
            state
                .metrics
                .record_batch(BatchStatus::Success, batch_result.duration_seconds);

            let tokens = batch_result.text.split_whitespace().count();
            state
                .outbound
                .send_droppable(OutboundEvent::BatchProcessed {
                    batch_index: batch_result.batch_index,
                    text: batch_result.text.clone(),
                    tokens,
                    duration: batch_result.duration_seconds,
                });

            let Some(running) = state.running.as_mut() else {
                return;
            };
            running.next_batch_index += 1;
            running.last_flush_at = Instant::now();
            running.transcript.push(batch_result);

            maybe_trigger_insight(state).await;
        }
        Err(err) => {
            let status = if err.is_transient() {
                BatchStatus::WorkerTransient
            } else {
                BatchStatus::WorkerUnavailable
            };
            state.metrics.record_batch(status, 0.0);
            fail_session(state, GatewayError::WorkerUnavailable(err.to_string())).await;
        }
    }
}

async fn maybe_trigger_insight(state: &mut SessionState) {
    if state.phase != Phase::Running {
        return;
    }
    let Some(manager) = state.insight_manager.clone() else {
        return;
    };
    let retain_tokens = state.defaults.insight_retain_tokens;
    let Some(running) = state.running.as_mut() else {
        return;
    };
    if !running.config.enable_insights {
        return;
    }

    let snapshot_text = build_insight_snapshot(&running.transcript, retain_tokens);
    let job = InsightJob {
        session_id: state.session_id.clone(),
        tenant_id: running.config.tenant_id.clone(),
        snapshot_text,
        requested_at: chrono::Utc::now(),
        reply: state.outbound.sender().downgrade(),
        emitted: running.insights_emitted.clone(),
    };

    match manager.submit(job) {
        SubmitOutcome::Queued | SubmitOutcome::Coalesced | SubmitOutcome::RerunRequested => {}
        SubmitOutcome::QueueFull => {
            running.insights_dropped += 1;
            state.metrics.record_failure("queue_full");
        }
        SubmitOutcome::Throttled | SubmitOutcome::SkippedTooShort | SubmitOutcome::ManagerShuttingDown => {
            running.insights_dropped += 1;
        }
    }
}

trait WorkerErrorExt {
    fn is_transient(&self) -> bool;
}

impl WorkerErrorExt for WorkerError {
    fn is_transient(&self) -> bool {
        matches!(self, WorkerError::ServerError(_) | WorkerError::Transport(_))
    }
}
