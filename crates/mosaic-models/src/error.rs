// Error types for sessions and the broker

use mosaic_abstraction::{EngineError, PipelineFamily};
use mosaic_weights::WeightsError;
use thiserror::Error;

use crate::config::BrokerConfigError;

/// Result type for session and broker operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session and broker errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation requested on a family with nothing resident
    #[error("No {0} session is loaded")]
    NoSessionLoaded(PipelineFamily),

    /// The model engine failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Weights could not be read, mapped or quantized
    #[error("Weight loading failed: {0}")]
    Weights(#[from] WeightsError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] BrokerConfigError),

    /// A blocking worker panicked or was cancelled
    #[error("Worker failed: {0}")]
    Worker(String),
}

/// Result of an operation that can be cancelled.
///
/// Cancellation is not an error, so it gets its own variant instead of a `SessionError`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The operation finished and its result was kept.
    Completed(T),
    /// Cancellation was observed; any result was discarded.
    Cancelled,
}

impl<T> Outcome<T> {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(value) => Outcome::Completed(f(value)),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}
