//! Session and endpoint provider traits.
//!
//! The messaging core drives the AMQP wire library through these
//! traits. Single-core design: no `Send` bounds, callbacks run on the
//! thread that ticks the messenger. `Session` is a cheap cloneable
//! handle; the host keeps one and hands clones to each messenger.

use crate::error::AmqpError;
use crate::link::{LinkDefinition, LinkState};
use crate::message::AmqpMessage;

/// Monotonic per-link identifier of an inbound delivery.
pub type DeliveryNumber = u32;

/// Result the wire library reports when it settles an outbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The delivery was accepted by the remote peer.
    Ok,
    /// The delivery failed or was settled with an error.
    Error,
}

/// Callback invoked exactly once when an outbound delivery settles.
pub type SettleCallback = Box<dyn FnOnce(SendOutcome)>;

/// Callback handling one inbound delivery.
///
/// Returning `Some(outcome)` settles the delivery synchronously;
/// returning `None` leaves it unsettled for a later explicit
/// disposition via [`MessageReceiver::send_disposition`].
pub type DeliveryCallback =
    Box<dyn FnMut(AmqpMessage, DeliveryNumber) -> Option<DeliveryOutcome>>;

/// Outcome declared for an inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivery processed successfully.
    Accepted,
    /// Delivery refused with an error condition.
    Rejected {
        /// AMQP error condition.
        condition: String,
        /// Human-readable description.
        description: String,
    },
    /// Delivery not processed; the service may redeliver.
    Released,
}

impl DeliveryOutcome {
    /// The accepted outcome.
    pub fn accepted() -> Self {
        DeliveryOutcome::Accepted
    }

    /// A rejected outcome with the given condition and description.
    pub fn rejected(condition: impl Into<String>, description: impl Into<String>) -> Self {
        DeliveryOutcome::Rejected {
            condition: condition.into(),
            description: description.into(),
        }
    }

    /// The released outcome.
    pub fn released() -> Self {
        DeliveryOutcome::Released
    }
}

/// Outbound endpoint of an attached link.
pub trait MessageSender {
    /// Begin attaching the endpoint. State progresses asynchronously and
    /// is observable through [`MessageSender::state`].
    fn open(&mut self) -> Result<(), AmqpError>;

    /// Current endpoint state.
    fn state(&self) -> LinkState;

    /// Hand one delivery to the wire library.
    ///
    /// `on_settled` fires exactly once when the delivery settles; if
    /// `send` itself returns an error the callback is dropped unfired.
    fn send(&mut self, message: AmqpMessage, on_settled: SettleCallback)
        -> Result<(), AmqpError>;
}

/// Inbound endpoint of an attached link.
pub trait MessageReceiver {
    /// Begin attaching the endpoint and register the delivery callback.
    fn open(&mut self, on_delivery: DeliveryCallback) -> Result<(), AmqpError>;

    /// Detach the endpoint.
    fn close(&mut self) -> Result<(), AmqpError>;

    /// Current endpoint state.
    fn state(&self) -> LinkState;

    /// Send the disposition for a previously unsettled delivery.
    ///
    /// `source_link` names the link the delivery arrived on; the pair of
    /// link name and delivery number identifies the delivery.
    fn send_disposition(
        &mut self,
        source_link: &str,
        delivery_number: DeliveryNumber,
        outcome: &DeliveryOutcome,
    ) -> Result<(), AmqpError>;
}

/// Handle to an AMQP session on which links can be created.
///
/// Implementations are handles (clone shares the underlying session).
/// The messaging core never mutates the session beyond creating links.
pub trait Session: Clone {
    /// Sender endpoint type produced by this session.
    type Sender: MessageSender;
    /// Receiver endpoint type produced by this session.
    type Receiver: MessageReceiver;

    /// Create a sender link endpoint from the definition.
    fn create_sender(&self, definition: &LinkDefinition) -> Result<Self::Sender, AmqpError>;

    /// Create a receiver link endpoint from the definition.
    fn create_receiver(&self, definition: &LinkDefinition) -> Result<Self::Receiver, AmqpError>;
}
