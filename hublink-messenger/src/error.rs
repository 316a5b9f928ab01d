//! Error types for messenger operations.

use hublink_core::AmqpError;
use thiserror::Error;

use crate::messenger::MessengerState;

/// Errors returned by messenger entry points.
///
/// Per-delivery and per-operation failures (send failed, timed out,
/// cancelled) are reported through completion callbacks, never through
/// these variants: once an entry point has accepted work, its return
/// value no longer speaks for that work.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// A required configuration field is missing or empty.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation is not allowed in the current state.
    #[error("operation not allowed in state {state:?}")]
    BadState {
        /// State the messenger was in when the operation was refused.
        state: MessengerState,
    },

    /// No receiver link exists to carry the disposition.
    #[error("no message receiver (not subscribed)")]
    NoReceiver,

    /// The option name is not recognized.
    #[error("unsupported option '{0}'")]
    UnsupportedOption(String),

    /// The option value has the wrong shape for the named option.
    #[error("invalid value for option '{0}'")]
    InvalidOptionValue(String),

    /// The wire library reported a failure.
    #[error(transparent)]
    Amqp(#[from] AmqpError),
}

/// Result type for messenger operations.
pub type MessengerResult<T> = Result<T, MessengerError>;
