//! Per-device AMQP messenger.
//!
//! Owns one sender link and at most one receiver link bound to the
//! device's service addresses, multiplexed over a caller-supplied
//! session. The host ticks [`AmqpMessenger::do_work`]; each tick
//! observes endpoint states, advances the lifecycle state machine,
//! creates or tears down links, drives the send queue, and sweeps
//! timeouts.
//!
//! # Lifecycle
//!
//! ```text
//!          start()            sender OPEN
//! Stopped ─────────► Starting ───────────► Started
//!    ▲                   │                    │
//!    │ stop()            │ sender failed /    │ sender left OPEN /
//!    └─── Stopping ◄─────┤ open timeout       │ receiver failed /
//!                        ▼                    ▼ repeated send errors
//!                      Error ◄────────────────┘
//! ```

/// Messenger configuration.
pub mod config;

/// Messenger state machine and tick loop.
pub mod core;

pub use self::config::{
    LinkConfig, MessengerConfig, OPTION_EVENT_SEND_TIMEOUT_SECS, OPTION_MESSAGE_QUEUE_OPTIONS,
};
pub use self::core::{
    AmqpMessenger, DispositionInfo, DispositionResult, MessageReceivedCallback, MessengerState,
    SendStatus, StateChangedCallback,
};
