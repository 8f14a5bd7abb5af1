use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webhook_inspector::config::Config;
use webhook_inspector::hooks::HookRegistry;
use webhook_inspector::http_server::{self, ServerState};
use webhook_inspector::hub::BroadcastHub;
use webhook_inspector::pipeline::{IngestionPipeline, PipelineSettings};
use webhook_inspector::replay::Replayer;
use webhook_inspector::retention::{self, RetentionPolicy};
use webhook_inspector::store::WebhookStore;

// ─── Logging ─────────────────────────────────────────────────────────────────

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_inspector=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();

    let store = match &config.data_dir {
        Some(dir) => WebhookStore::open(dir)
            .await
            .with_context(|| format!("failed to open delivery store in {}", dir.display()))?,
        None => {
            tracing::warn!("DATA_DIR not set, deliveries are kept in memory only");
            WebhookStore::in_memory()
        }
    };

    let pipeline = Arc::new(IngestionPipeline::new(
        PipelineSettings {
            secret: config.secret.clone(),
            strict_mode: config.strict_mode,
            timezone: config.timezone,
            dedup_capacity: config.dedup_capacity,
        },
        Arc::new(store),
        Arc::new(BroadcastHub::new()),
        HookRegistry::with_defaults(),
    ));

    // ─── Background loops ────────────────────────────────────────────────────

    let shutdown = CancellationToken::new();
    let background = TaskTracker::new();

    background.spawn(retention::run_loop(
        pipeline.clone(),
        RetentionPolicy {
            retention_days: config.retention_days,
            keep_count: config.keep_count,
        },
        config.cleanup_interval,
        shutdown.clone(),
    ));
    background.spawn(
        pipeline
            .hub()
            .clone()
            .run_heartbeat(config.heartbeat_interval, shutdown.clone()),
    );
    background.close();

    // ─── HTTP server ─────────────────────────────────────────────────────────

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        timezone = config.timezone.name(),
        strict_mode = config.strict_mode,
        "webhook-inspector listening"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    let state = ServerState::new(pipeline.clone(), Replayer::new(config.replay_timeout));
    http_server::serve(listener, state, shutdown.clone())
        .await
        .context("HTTP server error")?;

    // ─── Drain ───────────────────────────────────────────────────────────────

    shutdown.cancel();
    pipeline.flush().await;
    pipeline.hub().close_all().await;
    background.wait().await;
    tracing::info!("shutdown complete");
    Ok(())
}
