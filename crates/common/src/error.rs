use thiserror::Error;

/// Canonical fastforge error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FfxError::Cancelled`]: the calling task was asked to stop (shutdown or
///   stage interrupt); terminates the stage loop it surfaces in
/// - [`FfxError::Transient`]: backplane transport failures; the caller retries
///   with a fresh connection
/// - [`FfxError::Fatal`]: invariant breach inside the pipeline; aborts the
///   owning stage and is treated as unrecoverable by the driver
/// - [`FfxError::InvalidConfig`]: configuration/environment contract violations
/// - [`FfxError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum FfxError {
    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The calling task was cancelled.
    ///
    /// `suppressed` collects a secondary failure observed while unwinding the
    /// cancellation path (for example a transport disconnect that itself
    /// failed), so the primary cancellation is preserved.
    #[error("cancelled")]
    Cancelled {
        /// Failure raised by the cancellation path itself, if any.
        suppressed: Option<Box<FfxError>>,
    },

    /// Backplane transport failure; retry with a reconnect.
    #[error("transient backplane error: {0}")]
    Transient(String),

    /// Pipeline invariant breach; unrecoverable for the owning stage.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FfxError {
    /// Plain cancellation with no suppressed failure.
    pub fn cancelled() -> Self {
        FfxError::Cancelled { suppressed: None }
    }

    /// Returns whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FfxError::Cancelled { .. })
    }

    /// Attach a failure from the cancellation path, keeping `self` primary.
    ///
    /// Non-cancellation errors ignore the attachment and stay as-is.
    pub fn suppressing(self, other: FfxError) -> Self {
        match self {
            FfxError::Cancelled { .. } => FfxError::Cancelled {
                suppressed: Some(Box::new(other)),
            },
            primary => primary,
        }
    }
}

/// Standard fastforge result alias.
pub type Result<T> = std::result::Result<T, FfxError>;
