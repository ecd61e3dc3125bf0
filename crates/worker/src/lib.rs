//! Superscalar worker execution pipeline.
//!
//! Architecture role:
//! - [`context`]: the operation context handed between stages
//! - [`admission`]: multi-slot claim control with partial-claim rollback
//! - [`stage`]: the stage capability set, handoff slot, and generic runtime
//! - [`match_stage`]: the entry stage pulling work from the queue
//! - [`stages`]: input fetch, execute, and report stage handlers
//! - [`worker_context`]: the collaborator surface the pipeline drives
//! - [`pipeline`]: stage wiring, per-stage tasks, graceful shutdown
//!
//! Control flow: the pipeline spawns one task per stage. The match stage
//! pulls a queue entry through [`worker_context::WorkerContext::match_action`],
//! seeds the operation context, and forwards it downstream. Claims flow
//! forward then backward: a successor's slots are claimed before the transfer
//! finalizes, and released when the successor's handler finishes or rejects.

pub mod admission;
pub mod context;
pub mod match_stage;
pub mod pipeline;
pub mod stage;
pub mod stages;
pub mod worker_context;

pub use admission::Admission;
pub use context::{OperationContext, OperationContextBuilder};
pub use match_stage::{MatchListener, MatchStage};
pub use pipeline::{Pipeline, PipelineConfig};
pub use stage::{ErrorSink, PipelineStage, PutRejection, StageHandler, WorkStage};
pub use worker_context::{QueueWorkerContext, WorkerContext};
