//! # hublink-core
//!
//! Core abstractions for the hublink device messaging stack.
//!
//! This crate provides the foundational traits and types the messaging
//! core is written against. The messenger crates depend on these
//! abstractions rather than on a concrete AMQP 1.0 implementation,
//! allowing the same state machines to run over a production wire
//! library or a scripted in-memory fake during testing.
//!
//! ## The Provider Pattern
//!
//! The messaging core interacts with the outside world through a small
//! set of operations: creating links on an AMQP session, sending and
//! settling deliveries, and reading a monotonic clock. Each is a trait:
//!
//! | Trait | Production | Test | Purpose |
//! |-------|------------|------|---------|
//! | [`Session`] | wire library adapter | scripted fake | Link creation |
//! | [`MessageSender`] | wire library adapter | scripted fake | Outbound deliveries |
//! | [`MessageReceiver`] | wire library adapter | scripted fake | Inbound deliveries, dispositions |
//! | [`TimeProvider`] | [`SystemTimeProvider`] | manual clock | Timeouts |
//!
//! ## Core Types
//!
//! - [`AmqpMessage`]: properties, symbol-keyed annotations, data-section body
//! - [`LinkDefinition`]: everything needed to attach one AMQP link
//! - [`DeliveryOutcome`]: Accepted / Rejected / Released disposition values

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod error;
mod link;
mod message;
mod session;
mod time;

// Error exports
pub use error::AmqpError;

// Link exports
pub use link::{LinkDefinition, LinkRole, LinkState, ReceiverSettleMode, SenderSettleMode};

// Message exports
pub use message::{AmqpMessage, AmqpValue, Annotations, Properties, Symbol};

// Session trait exports
pub use session::{
    DeliveryCallback, DeliveryNumber, DeliveryOutcome, MessageReceiver, MessageSender,
    SendOutcome, Session, SettleCallback,
};

// Time exports
pub use time::{SystemTimeProvider, TimeProvider};
