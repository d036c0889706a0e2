//! Error types for surface tracking
//!
//! Flat hierarchy: one enum for everything above the transport, the
//! transport's own errors wrapped as a variant.

use std::time::Duration;
use thiserror::Error;

use crate::cdp::{CDPError, TargetId};

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    /// A bounded wait ran out. Recoverable, the caller decides whether to retry.
    #[error("Timeout {}ms exceeded while waiting for event \"{event}\"", .timeout.as_millis())]
    AttachmentTimeout { event: String, timeout: Duration },

    #[error("Target page, context or browser has been closed")]
    ContextClosed,

    /// Registry invariant violation: a closed surface was offered for registration.
    #[error("Surface {0} is already closed and cannot be registered")]
    StaleSurface(TargetId),

    #[error("Surface {0} has been closed")]
    SurfaceClosed(TargetId),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The whole persistent launch, connect included, ran out of time.
    #[error("launch_persistent: Timeout {}ms exceeded.", .0.as_millis())]
    LaunchTimeout(Duration),

    #[error(transparent)]
    Cdp(#[from] CDPError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContextError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ContextError::AttachmentTimeout { .. } | ContextError::LaunchTimeout(_)
        )
    }
}
