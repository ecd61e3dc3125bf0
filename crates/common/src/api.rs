//! Remote Execution-compatible value types.
//!
//! These mirror the Bazel Remote Execution API messages the worker pipeline
//! consumes and produces. Queue entries and operation updates travel between
//! processes as JSON-encoded strings; two processes built from this crate
//! produce byte-identical encodings for the same value, which is what the
//! queue's remove-by-value acknowledgement relies on.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Content-addressed blob reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex hash of the blob.
    pub hash: String,
    /// Size of the blob in bytes.
    pub size_bytes: i64,
}

impl Digest {
    /// Build a digest from parts.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }
}

/// Execution stage of an operation, as reported to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStage {
    /// Stage not set.
    #[default]
    Unknown,
    /// Checking the action cache.
    CacheCheck,
    /// Waiting in the operation queue.
    Queued,
    /// Currently being executed by a worker.
    Executing,
    /// Finished execution.
    Completed,
}

impl ExecutionStage {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStage::Unknown => "UNKNOWN",
            ExecutionStage::CacheCheck => "CACHE_CHECK",
            ExecutionStage::Queued => "QUEUED",
            ExecutionStage::Executing => "EXECUTING",
            ExecutionStage::Completed => "COMPLETED",
        }
    }
}

/// Client-supplied metadata identifying the request that produced an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Name of the tool that issued the request.
    #[serde(default)]
    pub tool_name: String,
    /// Version of the tool that issued the request.
    #[serde(default)]
    pub tool_version: String,
    /// Identifier of one tool invocation spanning many actions.
    #[serde(default)]
    pub tool_invocation_id: String,
    /// Identifier correlating several related invocations.
    #[serde(default)]
    pub correlated_invocations_id: String,
}

/// A single platform requirement attached to an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProperty {
    /// Property name (for example `min-cores`).
    pub name: String,
    /// Property value.
    pub value: String,
}

/// Platform requirements for an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Requirements in client order.
    #[serde(default)]
    pub properties: Vec<PlatformProperty>,
}

impl Platform {
    /// Look up a property value by name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Parsed `min-cores` requirement, if present and well-formed.
    pub fn min_cores(&self) -> Option<usize> {
        self.property("min-cores").and_then(|v| v.parse().ok())
    }
}

/// Server-side record of one execution request, carried inside a queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteEntry {
    /// Name of the long-running operation tracking this execution.
    pub operation_name: String,
    /// Digest of the action to execute.
    pub action_digest: Digest,
    /// Stream name for captured stdout.
    #[serde(default)]
    pub stdout_stream_name: String,
    /// Stream name for captured stderr.
    #[serde(default)]
    pub stderr_stream_name: String,
    /// When the server queued the execution.
    pub queued_timestamp: SystemTime,
    /// Client request metadata.
    #[serde(default)]
    pub request_metadata: RequestMetadata,
}

/// One dequeued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The execution request.
    pub execute_entry: ExecuteEntry,
    /// Digest of the preprocessed queued operation blob.
    pub queued_operation_digest: Digest,
    /// Platform requirements used for queue matching.
    #[serde(default)]
    pub platform: Platform,
}

/// Timing and identity details of one execution attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedActionMetadata {
    /// Identifier of the worker that ran the action.
    #[serde(default)]
    pub worker: String,
    /// When the server queued the action.
    pub queued_timestamp: Option<SystemTime>,
    /// When the worker picked the action up.
    pub worker_start_timestamp: Option<SystemTime>,
    /// When the worker finished all work on the action.
    pub worker_completed_timestamp: Option<SystemTime>,
    /// When input fetching started.
    pub input_fetch_start_timestamp: Option<SystemTime>,
    /// When input fetching completed.
    pub input_fetch_completed_timestamp: Option<SystemTime>,
    /// When command execution started.
    pub execution_start_timestamp: Option<SystemTime>,
    /// When command execution completed.
    pub execution_completed_timestamp: Option<SystemTime>,
}

/// Client-visible progress metadata for an execution operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOperationMetadata {
    /// Current execution stage.
    #[serde(default)]
    pub stage: ExecutionStage,
    /// Digest of the action being executed.
    #[serde(default)]
    pub action_digest: Digest,
    /// Stream name for captured stdout.
    #[serde(default)]
    pub stdout_stream_name: String,
    /// Stream name for captured stderr.
    #[serde(default)]
    pub stderr_stream_name: String,
    /// Timing details for the in-progress attempt.
    #[serde(default)]
    pub partial_execution_metadata: Option<ExecutedActionMetadata>,
}

/// Worker-side operation metadata: queue provenance plus progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperationMetadata {
    /// Digest of the preprocessed queued operation blob.
    #[serde(default)]
    pub queued_operation_digest: Digest,
    /// Client request metadata propagated from the execute request.
    #[serde(default)]
    pub request_metadata: RequestMetadata,
    /// Client-visible progress metadata.
    #[serde(default)]
    pub execute_operation_metadata: ExecuteOperationMetadata,
}

/// Long-running operation handle identifying one execution attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Server-assigned operation name.
    pub name: String,
    /// Progress metadata, absent before the worker seeds it.
    #[serde(default)]
    pub metadata: Option<QueuedOperationMetadata>,
    /// Whether the operation has reached a terminal state.
    #[serde(default)]
    pub done: bool,
}
