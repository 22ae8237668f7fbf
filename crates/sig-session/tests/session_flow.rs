//! End-to-end session scenarios (spec.md §8): drives a live `SessionActor`
//! against a mock Worker Client, the way the teacher's own actor tests
//! spawn a real actor rather than unit-testing its handler functions.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use ractor::Actor;
use sig_metrics::GatewayMetrics;
use sig_protocol::{InboundEvent, OutboundEvent};
use sig_session::{SessionActor, SessionArgs, SessionDefaults};
use sig_worker_client::WorkerClient;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn silence_chunk(seconds: f64, sample_rate: u32) -> String {
    let samples = (seconds * sample_rate as f64) as usize;
    let bytes = vec![0u8; samples * 2];
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn defaults() -> SessionDefaults {
    SessionDefaults {
        batch_window_sec: 5.0,
        max_batch_window_sec: 10.0,
        max_buffer_sec: 10.0,
        worker_model: "default".to_string(),
        worker_compute_type: "float16".to_string(),
        insight_retain_tokens: 60,
        insight_flush_timeout: Duration::from_secs(1),
    }
}

async fn drain_until_terminal(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn happy_path_emits_batch_then_final_summary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "hello there",
            "segments": [{"start": 0.0, "end": 1.0, "text": "hello there"}],
            "language": "en",
            "duration_seconds": 1.0,
        })))
        .mount(&server)
        .await;

    let worker = Arc::new(WorkerClient::new(server.uri()));
    let metrics = Arc::new(GatewayMetrics::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(32);

    let args = SessionArgs {
        session_id: "session-happy".to_string(),
        outbound: outbound_tx,
        worker,
        insight_manager: None,
        metrics,
        defaults: defaults(),
    };
    let (session_ref, _join) = Actor::spawn(None, SessionActor, args).await.unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Start {
            sample_rate: 16_000,
            encoding: "pcm16".to_string(),
            language: None,
            batch_window_sec: None,
            max_batch_window_sec: None,
            enable_insights: None,
            provider: None,
            tenant_id: None,
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Audio {
            chunk: silence_chunk(1.0, 16_000),
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Stop {}))
        .unwrap();

    let events = drain_until_terminal(&mut outbound_rx).await;

    assert!(matches!(events[0], OutboundEvent::Ready));
    assert!(matches!(events[1], OutboundEvent::SessionStarted { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, OutboundEvent::BatchProcessed { text, .. } if text == "hello there")));
    assert!(events.iter().any(|e| matches!(e, OutboundEvent::Final { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, OutboundEvent::FinalSummary { .. })));
    assert!(matches!(events.last().unwrap(), OutboundEvent::SessionEnded { .. }));
}

#[tokio::test]
async fn persistent_worker_failure_ends_session_with_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let worker = Arc::new(
        WorkerClient::new(server.uri()).with_retry_policy(sig_worker_client::RetryPolicy {
            retries: 1,
            backoff_base_ms: 1,
        }),
    );
    let metrics = Arc::new(GatewayMetrics::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(32);

    let args = SessionArgs {
        session_id: "session-fail".to_string(),
        outbound: outbound_tx,
        worker,
        insight_manager: None,
        metrics,
        defaults: defaults(),
    };
    let (session_ref, _join) = Actor::spawn(None, SessionActor, args).await.unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Start {
            sample_rate: 16_000,
            encoding: "pcm16".to_string(),
            language: None,
            batch_window_sec: None,
            max_batch_window_sec: None,
            enable_insights: None,
            provider: None,
            tenant_id: None,
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Audio {
            chunk: silence_chunk(11.0, 16_000),
        }))
        .unwrap();

    let events = drain_until_terminal(&mut outbound_rx).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, OutboundEvent::Error { .. })));
    assert!(matches!(events.last().unwrap(), OutboundEvent::SessionEnded { .. }));
}

#[tokio::test]
async fn unsupported_encoding_is_rejected_as_protocol_error() {
    let worker = Arc::new(WorkerClient::new("http://localhost:9".to_string()));
    let metrics = Arc::new(GatewayMetrics::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(32);

    let args = SessionArgs {
        session_id: "session-bad-encoding".to_string(),
        outbound: outbound_tx,
        worker,
        insight_manager: None,
        metrics,
        defaults: defaults(),
    };
    let (session_ref, _join) = Actor::spawn(None, SessionActor, args).await.unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Start {
            sample_rate: 16_000,
            encoding: "mulaw".to_string(),
            language: None,
            batch_window_sec: None,
            max_batch_window_sec: None,
            enable_insights: None,
            provider: None,
            tenant_id: None,
        }))
        .unwrap();

    let event = outbound_rx.recv().await.unwrap();
    assert!(matches!(event, OutboundEvent::Error { .. }));
}

/// spec.md §8 scenario 2: 15s of audio with insights enabled flushes two
/// batches (~5s, ~10s) but `INSIGHT_MIN_INTERVAL_SEC` suppresses the second
/// trigger, so at most one `insight` event reaches the client.
#[tokio::test(flavor = "multi_thread")]
async fn insight_throttle_suppresses_second_trigger_within_one_flush_cycle() {
    let worker_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "the customer asked about their order status today regarding a recent delivery delay",
            "segments": [],
            "language": "en",
            "duration_seconds": 5.0,
        })))
        .mount(&worker_server)
        .await;

    let chat_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content":
                "{\"type\":\"live_summary\",\"text\":\"order status inquiry\",\"confidence\":0.8}"
            }}],
        })))
        .mount(&chat_server)
        .await;

    let worker = Arc::new(WorkerClient::new(worker_server.uri()));
    let chat = Arc::new(sig_chat_client::ChatClient::new(
        chat_server.uri(),
        "test-key",
        sig_chat_client::BackendModels {
            fast: "fast".into(),
            balanced: "balanced".into(),
            high_context: "high".into(),
        },
    ));
    let insight_manager = Arc::new(sig_insight::InsightManager::spawn(
        sig_insight::InsightManagerConfig {
            min_interval: Duration::from_secs(10),
            ..Default::default()
        },
        chat,
        Arc::new(sig_insight::NoopMetricsSink),
    ));

    let metrics = Arc::new(GatewayMetrics::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);

    // Short windows so trigger 2 (buffered >= max_batch_window_sec) fires
    // synchronously on each append, rather than waiting on real wall-clock
    // time for trigger 1 to clear — note the session clamps batch_window_sec
    // to >= 0.5s (spec.md §3), so chunks must clear that floor to land on
    // trigger 2 rather than arming the real-time timer.
    let mut session_defaults = defaults();
    session_defaults.batch_window_sec = 0.1;
    session_defaults.max_batch_window_sec = 0.2;
    session_defaults.max_buffer_sec = 5.0;

    let args = SessionArgs {
        session_id: "session-insights".to_string(),
        outbound: outbound_tx,
        worker,
        insight_manager: Some(insight_manager),
        metrics,
        defaults: session_defaults,
    };
    let (session_ref, _join) = Actor::spawn(None, SessionActor, args).await.unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Start {
            sample_rate: 16_000,
            encoding: "pcm16".to_string(),
            language: None,
            batch_window_sec: None,
            max_batch_window_sec: None,
            enable_insights: Some(true),
            provider: None,
            tenant_id: None,
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Audio {
            chunk: silence_chunk(0.6, 16_000),
        }))
        .unwrap();
    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Audio {
            chunk: silence_chunk(0.6, 16_000),
        }))
        .unwrap();
    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Stop {}))
        .unwrap();

    let events = drain_until_terminal(&mut outbound_rx).await;

    let batch_count = events
        .iter()
        .filter(|e| matches!(e, OutboundEvent::BatchProcessed { .. }))
        .count();
    assert_eq!(batch_count, 2);

    let insight_count = events
        .iter()
        .filter(|e| matches!(e, OutboundEvent::Insight { .. }))
        .count();
    assert!(insight_count <= 1, "min interval should suppress the second insight trigger");

    assert!(matches!(events.last().unwrap(), OutboundEvent::SessionEnded { .. }));
}

/// spec.md §8 scenario 5: an insight job still running when `stop` arrives
/// and outliving the drain deadline surfaces as `insight_flush_timeout`
/// rather than hanging the session close indefinitely.
#[tokio::test(flavor = "multi_thread")]
async fn slow_insight_job_at_drain_reports_flush_timeout() {
    let worker_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "the customer asked about their order status today regarding a recent delivery delay",
            "segments": [],
            "language": "en",
            "duration_seconds": 5.0,
        })))
        .mount(&worker_server)
        .await;

    let chat_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "choices": [{"message": {"content":
                        "{\"type\":\"live_summary\",\"text\":\"order status inquiry\",\"confidence\":0.8}"
                    }}],
                }))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&chat_server)
        .await;

    let worker = Arc::new(WorkerClient::new(worker_server.uri()));
    let chat = Arc::new(sig_chat_client::ChatClient::new(
        chat_server.uri(),
        "test-key",
        sig_chat_client::BackendModels {
            fast: "fast".into(),
            balanced: "balanced".into(),
            high_context: "high".into(),
        },
    ));
    let insight_manager = Arc::new(sig_insight::InsightManager::spawn(
        sig_insight::InsightManagerConfig::default(),
        chat,
        Arc::new(sig_insight::NoopMetricsSink),
    ));

    let metrics = Arc::new(GatewayMetrics::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);

    let mut session_defaults = defaults();
    // Shorter than the chat mock's delay, so drain() observes the job
    // still in_flight when its own deadline elapses.
    session_defaults.insight_flush_timeout = Duration::from_millis(50);

    let args = SessionArgs {
        session_id: "session-slow-insight".to_string(),
        outbound: outbound_tx,
        worker,
        insight_manager: Some(insight_manager),
        metrics,
        defaults: session_defaults,
    };
    let (session_ref, _join) = Actor::spawn(None, SessionActor, args).await.unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Start {
            sample_rate: 16_000,
            encoding: "pcm16".to_string(),
            language: None,
            batch_window_sec: None,
            max_batch_window_sec: None,
            enable_insights: Some(true),
            provider: None,
            tenant_id: None,
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Audio {
            chunk: silence_chunk(11.0, 16_000),
        }))
        .unwrap();

    // Give the insight dispatcher a chance to pick the job up and start
    // the (slow) chat call before stop tears the session down.
    tokio::time::sleep(Duration::from_millis(100)).await;

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Stop {}))
        .unwrap();

    let events = drain_until_terminal(&mut outbound_rx).await;

    assert!(events.iter().any(
        |e| matches!(e, OutboundEvent::Error { code, .. } if *code == sig_protocol::ErrorCode::InsightFlushTimeout)
    ));
    assert!(matches!(events.last().unwrap(), OutboundEvent::SessionEnded { .. }));
}

/// spec.md §8: a second `stop` after the session has already started
/// draining is a no-op, not a protocol error.
#[tokio::test]
async fn second_stop_after_draining_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "hello there",
            "segments": [{"start": 0.0, "end": 1.0, "text": "hello there"}],
            "language": "en",
            "duration_seconds": 1.0,
        })))
        .mount(&server)
        .await;

    let worker = Arc::new(WorkerClient::new(server.uri()));
    let metrics = Arc::new(GatewayMetrics::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(32);

    let args = SessionArgs {
        session_id: "session-double-stop".to_string(),
        outbound: outbound_tx,
        worker,
        insight_manager: None,
        metrics,
        defaults: defaults(),
    };
    let (session_ref, _join) = Actor::spawn(None, SessionActor, args).await.unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Start {
            sample_rate: 16_000,
            encoding: "pcm16".to_string(),
            language: None,
            batch_window_sec: None,
            max_batch_window_sec: None,
            enable_insights: None,
            provider: None,
            tenant_id: None,
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Audio {
            chunk: silence_chunk(1.0, 16_000),
        }))
        .unwrap();

    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Stop {}))
        .unwrap();
    // Sent before the actor has necessarily finished draining; must not
    // produce a second Error/SessionEnded pair or panic the actor.
    session_ref
        .cast(sig_session::SessionMsg::Inbound(InboundEvent::Stop {}))
        .unwrap();

    let events = drain_until_terminal(&mut outbound_rx).await;

    let ended_count = events
        .iter()
        .filter(|e| matches!(e, OutboundEvent::SessionEnded { .. }))
        .count();
    assert_eq!(ended_count, 1);
    assert!(!events.iter().any(|e| matches!(e, OutboundEvent::Error { .. })));
}
