//! Link definitions and endpoint states.

use std::collections::BTreeMap;

use crate::message::{AmqpValue, Symbol};

/// Role of a link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Local endpoint sends deliveries.
    Sender,
    /// Local endpoint receives deliveries.
    Receiver,
}

/// Externally observable state of a sender or receiver endpoint.
///
/// Reported by the wire library; the messenger polls this on every tick
/// and drives its own lifecycle state machine from the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not opened yet, or already torn down.
    Idle,
    /// Attach in progress.
    Opening,
    /// Attached and usable.
    Open,
    /// Detach in progress.
    Closing,
    /// The endpoint failed.
    Error,
}

/// Settlement mode declared by the sender on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled and settled by disposition.
    Unsettled,
    /// Deliveries are sent pre-settled.
    Settled,
    /// Either, per delivery.
    Mixed,
}

/// Settlement mode declared by the receiver on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// Settle on first disposition.
    First,
    /// Settle after the sender confirms.
    Second,
}

/// Everything needed to attach one AMQP link on a session.
///
/// The source and target are plain addresses: for a sender the target is
/// the service address and the source is a synthetic local name; for a
/// receiver the roles swap.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDefinition {
    /// Unique link name.
    pub name: String,
    /// Local endpoint role.
    pub role: LinkRole,
    /// Source address.
    pub source: String,
    /// Target address.
    pub target: String,
    /// Sender settlement mode sent with the attach frame.
    pub sender_settle_mode: SenderSettleMode,
    /// Receiver settlement mode sent with the attach frame.
    pub receiver_settle_mode: ReceiverSettleMode,
    /// Maximum message size for the link.
    pub max_message_size: u64,
    /// Attach properties: symbol keys, typed values.
    pub attach_properties: BTreeMap<Symbol, AmqpValue>,
}
