//! Periodic liveness re-assertion for held queue entries.
//!
//! A worker holding a queue entry keeps it live with the backplane by
//! re-asserting the entry's current execution stage on every tick. The tick
//! period must stay at or below half of the backplane's liveness window or
//! the entry is treated as orphaned and swept back to the queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ffx_common::api::ExecutionStage;
use ffx_common::metrics::global_metrics;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receiver of poller ticks.
#[async_trait]
pub trait PollSink: Send + Sync {
    /// Re-assert liveness of the held entry at `stage`.
    ///
    /// Returning false means the backplane no longer recognizes the entry;
    /// the poller terminates itself.
    async fn poll(&self, stage: ExecutionStage) -> bool;
}

/// Lifecycle of a poller. Transitions run ACTIVE → PAUSED → TERMINATED, with
/// PAUSED allowing a resume; TERMINATED is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Ticking, re-asserting at the carried stage.
    Active(ExecutionStage),
    /// Retained but not ticking; may resume at a new stage.
    Paused,
    /// Released; ticks never resume.
    Terminated,
}

struct PollerInner {
    state: std::sync::Mutex<PollerState>,
}

/// Background liveness poller owned by one operation context.
///
/// Dropping a poller terminates it, so an abandoned context cannot leave a
/// tick task behind.
pub struct Poller {
    inner: Arc<PollerInner>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Start a poller in ACTIVE state at `stage`, ticking every `period`.
    pub fn start(period: Duration, stage: ExecutionStage, sink: Arc<dyn PollSink>) -> Self {
        let inner = Arc::new(PollerInner {
            state: std::sync::Mutex::new(PollerState::Active(stage)),
        });
        let tick_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let stage = match *tick_inner.state.lock().expect("poller state") {
                    PollerState::Active(stage) => Some(stage),
                    PollerState::Paused => None,
                    PollerState::Terminated => break,
                };
                if let Some(stage) = stage {
                    global_metrics().inc_poll_tick(stage.as_str());
                    if !sink.poll(stage).await {
                        debug!(stage = stage.as_str(), "liveness lost; poller terminating");
                        *tick_inner.state.lock().expect("poller state") = PollerState::Terminated;
                        break;
                    }
                }
            }
        });
        Self {
            inner,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PollerState {
        *self.inner.state.lock().expect("poller state")
    }

    /// Stop ticking while retaining the poller for a later resume.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock().expect("poller state");
        if *state != PollerState::Terminated {
            *state = PollerState::Paused;
        }
    }

    /// Resume ticking, re-asserting at `stage` from the next tick on.
    pub fn resume(&self, stage: ExecutionStage) {
        let mut state = self.inner.state.lock().expect("poller state");
        if *state != PollerState::Terminated {
            *state = PollerState::Active(stage);
        }
    }

    /// Release the poller; ticks stop and never resume.
    pub fn terminate(&self) {
        *self.inner.state.lock().expect("poller state") = PollerState::Terminated;
        if let Some(handle) = self.handle.lock().expect("poller handle").take() {
            handle.abort();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller").field("state", &self.state()).finish()
    }
}
