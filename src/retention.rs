use crate::pipeline::IngestionPipeline;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// 0 disables the age limit.
    pub retention_days: u32,
    /// 0 disables the count limit.
    pub keep_count: usize,
}

/// Run one cleanup pass, sparing deliveries still being processed.
pub async fn run_once(pipeline: &IngestionPipeline, policy: RetentionPolicy) -> usize {
    let in_flight = pipeline.in_flight();
    match pipeline
        .store()
        .delete_older_than_or_beyond_count(policy.retention_days, policy.keep_count, &in_flight, Utc::now())
        .await
    {
        Ok(0) => 0,
        Ok(deleted) => {
            tracing::info!(
                deleted,
                retention_days = policy.retention_days,
                keep_count = policy.keep_count,
                "retention cleanup removed deliveries"
            );
            deleted
        }
        Err(e) => {
            tracing::error!(error = %e, "retention cleanup failed");
            0
        }
    }
}

pub async fn run_loop(
    pipeline: Arc<IngestionPipeline>,
    policy: RetentionPolicy,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                run_once(&pipeline, policy).await;
            }
        }
    }
    tracing::debug!("retention loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookRegistry;
    use crate::hub::BroadcastHub;
    use crate::pipeline::PipelineSettings;
    use crate::store::WebhookStore;
    use axum::body::Bytes;
    use axum::http::HeaderMap;

    #[tokio::test]
    async fn keeps_most_recent() {
        let pipeline = Arc::new(IngestionPipeline::new(
            PipelineSettings {
                secret: None,
                strict_mode: false,
                timezone: chrono_tz::UTC,
                dedup_capacity: 100,
            },
            Arc::new(WebhookStore::in_memory()),
            Arc::new(BroadcastHub::new()),
            HookRegistry::new(),
        ));
        for i in 0..5 {
            pipeline.ingest(&HeaderMap::new(), Bytes::from(format!(r#"{{"n":{i}}}"#)), None);
        }
        pipeline.flush().await;

        let policy = RetentionPolicy { retention_days: 30, keep_count: 2 };
        assert_eq!(run_once(&pipeline, policy).await, 3);
        assert_eq!(pipeline.store().len().await, 2);
        assert_eq!(run_once(&pipeline, policy).await, 0);
    }
}
