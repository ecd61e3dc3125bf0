//! Operation context handed between pipeline stages.
//!
//! The context exists in two phases. [`OperationContextBuilder`] is the
//! mutable phase, owned by exactly one stage at a time; [`OperationContext`]
//! is the frozen phase used for every inter-stage handoff. A stage thaws the
//! context it took, mutates it, and freezes it again before forwarding, so
//! the mutable phase is never aliased across tasks.

use ffx_backplane::poller::Poller;
use ffx_common::api::{Operation, QueueEntry, QueuedOperationMetadata};

/// Frozen operation context.
///
/// Invariants: `queue_entry` and `poller` are present from the moment the
/// match stage forwards the context until the terminal stage releases them;
/// upstream stages never touch a context they have handed off.
#[derive(Debug)]
pub struct OperationContext {
    /// Long-running operation descriptor; empty until the match stage seeds it.
    pub operation: Operation,
    /// Worker-side operation metadata accumulated across stages.
    pub metadata: QueuedOperationMetadata,
    /// The dequeued work item.
    pub queue_entry: Option<QueueEntry>,
    /// Liveness poller owned by this context.
    pub poller: Option<Poller>,
    /// Exit code recorded by the execute stage.
    pub exit_code: Option<i32>,
}

impl OperationContext {
    /// Re-enter the mutable phase. The caller becomes the sole owner.
    pub fn thaw(self) -> OperationContextBuilder {
        OperationContextBuilder {
            operation: self.operation,
            metadata: self.metadata,
            queue_entry: self.queue_entry,
            poller: self.poller,
            exit_code: self.exit_code,
        }
    }

    /// Operation name, or a placeholder before the match stage seeds one.
    pub fn operation_name(&self) -> &str {
        if self.operation.name.is_empty() {
            "(unmatched)"
        } else {
            &self.operation.name
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        OperationContextBuilder::default().freeze()
    }
}

/// Mutable phase of an operation context.
#[derive(Default)]
pub struct OperationContextBuilder {
    /// Long-running operation descriptor.
    pub operation: Operation,
    /// Worker-side operation metadata.
    pub metadata: QueuedOperationMetadata,
    /// The dequeued work item.
    pub queue_entry: Option<QueueEntry>,
    /// Liveness poller owned by this context.
    pub poller: Option<Poller>,
    /// Exit code recorded by the execute stage.
    pub exit_code: Option<i32>,
}

impl OperationContextBuilder {
    /// Leave the mutable phase; the result is safe to hand to another task.
    pub fn freeze(self) -> OperationContext {
        OperationContext {
            operation: self.operation,
            metadata: self.metadata,
            queue_entry: self.queue_entry,
            poller: self.poller,
            exit_code: self.exit_code,
        }
    }
}
