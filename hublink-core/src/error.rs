//! Error type surfaced by AMQP collaborator implementations.

use thiserror::Error;

/// Errors reported by the underlying AMQP wire library.
///
/// The messaging core treats these as opaque failures: it logs them,
/// rolls back the operation that triggered them, and decides on a state
/// transition. It never inspects the payload.
#[derive(Debug, Clone, Error)]
pub enum AmqpError {
    /// The session refused to create the link.
    #[error("link creation failed: {0}")]
    LinkCreate(String),

    /// The endpoint could not be opened.
    #[error("link open failed: {0}")]
    Open(String),

    /// The endpoint could not be closed cleanly.
    #[error("link close failed: {0}")]
    Close(String),

    /// The sender refused to take the delivery.
    #[error("send refused: {0}")]
    SendRefused(String),

    /// The disposition could not be sent for an inbound delivery.
    #[error("disposition failed: {0}")]
    Disposition(String),
}
