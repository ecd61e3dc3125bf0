//! Stage wiring and lifecycle for one worker's pipeline.
//!
//! The pipeline is a directed chain — match → input fetch → execute →
//! report — with a single error sink. One task runs per stage. Shutdown
//! sequencing: latch the match stage so nothing new is consumed, wait for
//! downstream stages to drain their claims and slots, then interrupt all
//! stages and join their tasks.

use std::sync::Arc;
use std::time::Duration;

use ffx_common::Result;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::match_stage::MatchStage;
use crate::stage::{ErrorSink, PipelineStage, WorkStage};
use crate::stages::{ExecuteActionHandler, InputFetchHandler, ReportResultHandler};
use crate::worker_context::WorkerContext;

/// Stage widths and shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Admission slots in the input fetch stage.
    #[serde(default = "default_input_fetch_width")]
    pub input_fetch_width: usize,
    /// Admission slots in the execute stage; also the per-action core-claim
    /// ceiling.
    #[serde(default = "default_execute_width")]
    pub execute_width: usize,
    /// Admission slots in the report stage.
    #[serde(default = "default_report_width")]
    pub report_width: usize,
    /// How long shutdown waits for in-flight work to drain before
    /// interrupting, in milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_input_fetch_width() -> usize {
    4
}

fn default_execute_width() -> usize {
    4
}

fn default_report_width() -> usize {
    1
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_fetch_width: default_input_fetch_width(),
            execute_width: default_execute_width(),
            report_width: default_report_width(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// One worker's stage chain and its running tasks.
pub struct Pipeline {
    match_stage: Arc<MatchStage>,
    input_fetch: Arc<WorkStage<InputFetchHandler>>,
    execute: Arc<WorkStage<ExecuteActionHandler>>,
    report: Arc<WorkStage<ReportResultHandler>>,
    handles: std::sync::Mutex<Vec<(&'static str, JoinHandle<Result<()>>)>>,
}

impl Pipeline {
    /// Wire the stage chain over `worker_context`. Stages are linked once
    /// and never re-linked.
    pub fn new(worker_context: Arc<dyn WorkerContext>, config: &PipelineConfig) -> Self {
        let error: Arc<dyn PipelineStage> = Arc::new(ErrorSink);
        let report = WorkStage::new(
            ReportResultHandler::new(Arc::clone(&worker_context)),
            config.report_width,
            None,
            Arc::clone(&error),
        );
        let execute = WorkStage::new(
            ExecuteActionHandler::new(Arc::clone(&worker_context), config.execute_width),
            config.execute_width,
            Some(Arc::clone(&report) as Arc<dyn PipelineStage>),
            Arc::clone(&error),
        );
        let input_fetch = WorkStage::new(
            InputFetchHandler::new(Arc::clone(&worker_context)),
            config.input_fetch_width,
            Some(Arc::clone(&execute) as Arc<dyn PipelineStage>),
            Arc::clone(&error),
        );
        let match_stage = MatchStage::new(
            worker_context,
            Arc::clone(&input_fetch) as Arc<dyn PipelineStage>,
            error,
        );
        Self {
            match_stage,
            input_fetch,
            execute,
            report,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn one task per stage.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("pipeline handles");
        handles.push(("MatchStage", tokio::spawn(Arc::clone(&self.match_stage).run())));
        handles.push((
            "InputFetchStage",
            tokio::spawn(Arc::clone(&self.input_fetch).run()),
        ));
        handles.push((
            "ExecuteActionStage",
            tokio::spawn(Arc::clone(&self.execute).run()),
        ));
        handles.push((
            "ReportResultStage",
            tokio::spawn(Arc::clone(&self.report).run()),
        ));
        info!("pipeline started");
    }

    /// Latch the match stage; nothing new is consumed from the queue.
    pub fn prepare_for_graceful_shutdown(&self) {
        self.match_stage.prepare_for_graceful_shutdown();
    }

    /// Whether no stage holds claims or slot contents.
    pub fn is_drained(&self) -> bool {
        self.input_fetch.is_drained() && self.execute.is_drained() && self.report.is_drained()
    }

    /// Graceful shutdown: latch ingestion, drain, interrupt, join.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.prepare_for_graceful_shutdown();
        let deadline = Instant::now() + drain_timeout;
        while !self.is_drained() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.is_drained() {
            warn!("drain deadline exceeded; interrupting with work in flight");
        }

        self.match_stage.interrupt();
        self.input_fetch.interrupt();
        self.execute.interrupt();
        self.report.interrupt();

        let handles = std::mem::take(&mut *self.handles.lock().expect("pipeline handles"));
        for (stage, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(stage, error = %e, "stage exited fatally"),
                Err(join) => error!(stage, error = %join, "stage task panicked"),
            }
        }
        info!("pipeline stopped");
    }
}
