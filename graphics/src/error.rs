//! Graphics error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the graphics system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// Failed to create a resource (image, buffer, semaphore, command pool).
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// Failed to begin, record or compile a command buffer.
    #[error("command recording failed: {0}")]
    CommandRecordingFailed(String),
    /// The device or queue rejected a submission.
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    /// A bounded wait on a completion signal expired.
    #[error("timed out after {timeout:?} waiting for {what}")]
    SynchronizationTimeout {
        /// What was being waited on.
        what: String,
        /// The timeout that expired.
        timeout: Duration,
    },
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// The descriptor pool could not provide a set.
    #[error("descriptor allocation failed: {0}")]
    DescriptorAllocationFailed(String),
    /// A surface was reached again while its own dependencies were being committed.
    #[error("dependency cycle detected at surface {surface}")]
    DependencyCycle {
        /// Label (or id) of the surface that closed the cycle.
        surface: String,
    },
    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A requested feature is not supported.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GraphicsError {
    /// Returns true if the error leaves GPU state unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost
                | Self::SynchronizationTimeout { .. }
                | Self::ResourceCreationFailed(_)
                | Self::CommandRecordingFailed(_)
        )
    }
}
