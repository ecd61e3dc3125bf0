use std::env;
use std::sync::Arc;
use std::time::Duration;

use ffx_backplane::queue::WorkQueue;
use ffx_backplane::store::{ListStore, RedisListStore};
use ffx_common::ids::{QueueName, WorkerId};
use ffx_common::BackplaneConfig;
use ffx_worker::{Pipeline, PipelineConfig, QueueWorkerContext};

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let worker_id = env_or_default("FFX_WORKER_ID", "worker-1");
    let backplane = BackplaneConfig {
        url: env_or_default("FFX_BACKPLANE_URL", "redis://127.0.0.1:6379"),
        queue_name: env_or_default("FFX_QUEUE_NAME", "{ops}:queue"),
        dequeue_timeout_ms: env_u64_or_default("FFX_DEQUEUE_TIMEOUT_MS", 1_000),
        poller_period_ms: env_u64_or_default("FFX_POLLER_PERIOD_MS", 10_000),
    };
    let pipeline_config = PipelineConfig {
        input_fetch_width: env_usize_or_default("FFX_INPUT_FETCH_WIDTH", 4),
        execute_width: env_usize_or_default("FFX_EXECUTE_WIDTH", 4),
        report_width: env_usize_or_default("FFX_REPORT_WIDTH", 1),
        drain_timeout_ms: env_u64_or_default("FFX_DRAIN_TIMEOUT_MS", 30_000),
    };

    let store = Arc::new(RedisListStore::connect(&backplane.url).await?);
    let queue = WorkQueue::new(
        store as Arc<dyn ListStore>,
        QueueName(backplane.queue_name.clone()),
    );
    let worker_context = Arc::new(QueueWorkerContext::new(
        WorkerId(worker_id),
        queue,
        &backplane,
    ));

    let pipeline = Pipeline::new(worker_context, &pipeline_config);
    pipeline.start();
    tracing::info!(
        queue = %backplane.queue_name,
        "worker running; send SIGINT for graceful shutdown"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; draining in-flight work");
    pipeline
        .shutdown(Duration::from_millis(pipeline_config.drain_timeout_ms))
        .await;
    Ok(())
}
