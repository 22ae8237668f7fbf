use std::sync::Arc;

use ractor::{Actor, ActorRef};
use sig_chat_client::{BackendModels, ChatBackendThresholds, ChatClient};
use sig_config::GatewayConfig;
use sig_insight::{InsightManager, InsightManagerConfig};
use sig_metrics::GatewayMetrics;
use sig_session::{RootActor, RootArgs, RootMsg, SessionDefaults};
use sig_worker_client::{RetryPolicy, WorkerClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub worker: Arc<WorkerClient>,
    pub insight_manager: Option<Arc<InsightManager>>,
    pub metrics: Arc<GatewayMetrics>,
    pub session_defaults: SessionDefaults,
    pub root: ActorRef<RootMsg>,
}

impl AppState {
    pub async fn build(config: GatewayConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(GatewayMetrics::new());

        let worker = Arc::new(
            WorkerClient::new(config.worker_base_url.clone()).with_retry_policy(RetryPolicy {
                retries: config.worker_retries,
                backoff_base_ms: config.worker_backoff_base_ms,
            }),
        );

        let chat = Arc::new(
            ChatClient::new(
                config.chat_base_url.clone(),
                config.chat_api_key.clone().unwrap_or_default(),
                BackendModels {
                    fast: "fast".to_string(),
                    balanced: "balanced".to_string(),
                    high_context: "high-context".to_string(),
                },
            )
            .with_thresholds(ChatBackendThresholds {
                fast_ceiling: config.routing_thresholds.fast_ceiling,
                balanced_ceiling: config.routing_thresholds.balanced_ceiling,
                max_context: config.routing_thresholds.max_context,
            }),
        );

        let insight_manager = Some(Arc::new(InsightManager::spawn(
            InsightManagerConfig {
                queue_capacity: config.insight_queue_maxsize,
                worker_concurrency: config.insight_worker_concurrency,
                min_tokens: config.insight_min_tokens,
                min_interval: config.insight_min_interval,
                per_tenant_max: config.insight_per_tenant_max,
                retain_tokens: config.insight_retain_tokens,
                flush_timeout: config.insight_flush_timeout,
            },
            chat,
            metrics.clone(),
        )));

        let session_defaults = SessionDefaults {
            batch_window_sec: config.batch_window_sec,
            max_batch_window_sec: config.max_batch_window_sec,
            max_buffer_sec: config.max_buffer_sec,
            worker_model: "default".to_string(),
            worker_compute_type: "float16".to_string(),
            insight_retain_tokens: config.insight_retain_tokens,
            insight_flush_timeout: config.insight_flush_timeout,
        };

        let (root, _root_join) = Actor::spawn(
            Some("gateway_root".into()),
            RootActor,
            RootArgs {
                metrics: metrics.clone(),
            },
        )
        .await?;

        Ok(Self {
            config,
            worker,
            insight_manager,
            metrics,
            session_defaults,
            root,
        })
    }
}
