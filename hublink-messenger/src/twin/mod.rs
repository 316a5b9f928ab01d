//! Twin messenger.
//!
//! Implements the device-twin request/response protocol on top of the
//! AMQP messenger: reporting device properties (PATCH), fetching the
//! complete twin document (GET), subscribing to desired-property
//! updates (PUT), and unsubscribing (DELETE). Responses are matched to
//! requests by correlation-id; desired-property deltas arrive without
//! one.
//!
//! # Subscription cycle
//!
//! ```text
//! NotSubscribed → GetCompleteProperties → GettingCompleteProperties
//!       ▲                                          │ GET response
//!       │ DELETE 2xx                               ▼
//! Unsubscribing ◄─ Unsubscribe ◄─ Subscribed ◄─ Subscribing
//!                                      ▲   PUT 2xx   │
//!                                      └─────────────┘
//! ```
//!
//! Three cumulative subscription failures put the twin messenger in the
//! Error state.

mod envelope;

/// Twin messenger state machines and public API.
pub mod core;

pub use self::core::{
    ReportStateCallback, ReportStateOutcome, ReportStateReason, SubscriptionState, TwinConfig,
    TwinMessenger, TwinState, TwinStateChangedCallback, TwinUpdateCallback, TwinUpdateKind,
};
pub use self::envelope::TwinOperationKind;
