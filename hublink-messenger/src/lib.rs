//! # hublink-messenger
//!
//! Device-side messaging core riding on an AMQP 1.0 session.
//!
//! Two layered components hide the sender/receiver link lifecycle
//! (attach, credit, settlement, timeouts, failure states) behind
//! tick-driven state machines:
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 Host transport                   │
//! │        owns the session, ticks do_work()         │
//! ├─────────────────────────────────────────────────┤
//! │     TwinMessenger (twin request/response)        │
//! │     • PATCH / GET / PUT / DELETE envelopes       │
//! │     • correlation-id table, subscription cycle   │
//! ├─────────────────────────────────────────────────┤
//! │     AmqpMessenger (per-device link pair)         │
//! │     • sender/receiver lifecycle state machine    │
//! │     • queued sends with enqueue-age timeouts     │
//! │     • inbound dispatch and dispositions          │
//! ├─────────────────────────────────────────────────┤
//! │     hublink-core traits (wire library seam)      │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling model
//!
//! Single-threaded cooperative: every state mutation happens inside a
//! public entry point or inside a [`AmqpMessenger::do_work`] /
//! [`TwinMessenger::do_work`] tick driven by the host. Completion and
//! delivery callbacks run on the ticking thread and may re-enter the
//! messenger. Nothing blocks; long-running I/O belongs to the session's
//! owner.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use hublink_core::{
    AmqpError, AmqpMessage, AmqpValue, Annotations, DeliveryCallback, DeliveryNumber,
    DeliveryOutcome, LinkDefinition, LinkRole, LinkState, MessageReceiver, MessageSender,
    Properties, ReceiverSettleMode, SendOutcome, SenderSettleMode, Session, SettleCallback,
    Symbol, SystemTimeProvider, TimeProvider,
};

/// Error types for messenger operations.
pub mod error;

/// Outbound send queue with enqueue-age timeouts.
pub mod queue;

/// Per-device AMQP messenger.
pub mod messenger;

/// Twin messenger layered on the AMQP messenger.
pub mod twin;

// Error exports
pub use error::{MessengerError, MessengerResult};

// Queue exports
pub use queue::{QueueOptions, SendCompleteCallback, SendCompletion, SendQueue};

// Messenger exports
pub use messenger::{
    AmqpMessenger, DispositionInfo, DispositionResult, LinkConfig, MessageReceivedCallback,
    MessengerConfig, MessengerState, SendStatus, StateChangedCallback,
    OPTION_EVENT_SEND_TIMEOUT_SECS, OPTION_MESSAGE_QUEUE_OPTIONS,
};

// Twin exports
pub use twin::{
    ReportStateCallback, ReportStateOutcome, ReportStateReason, SubscriptionState, TwinConfig,
    TwinMessenger, TwinOperationKind, TwinState, TwinStateChangedCallback, TwinUpdateCallback,
    TwinUpdateKind,
};
