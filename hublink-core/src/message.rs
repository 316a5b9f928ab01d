//! AMQP message model.
//!
//! A deliberately small slice of the AMQP 1.0 message format: the
//! properties section (correlation-id), symbol-keyed message
//! annotations, and a body made of binary data sections. This is the
//! complete surface the device messaging core reads and writes; the
//! wire library owns everything else.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// An AMQP symbol.
///
/// Symbols key message annotations and link attach properties. They are
/// kept distinct from plain strings because the wire encoding differs
/// and services match on the encoded type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// View the symbol as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed AMQP value carried in message annotations.
///
/// Only the types the device messaging protocol actually exchanges are
/// modeled. Services are strict about annotation types (a twin `status`
/// must be an AMQP int, a twin `version` an AMQP long), so consumers
/// match on the variant rather than coercing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmqpValue {
    /// AMQP null.
    Null,
    /// AMQP string.
    String(String),
    /// AMQP int (32-bit signed).
    Int(i32),
    /// AMQP long (64-bit signed).
    Long(i64),
}

impl AmqpValue {
    /// The contained string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmqpValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// The contained int, if this is an int value.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            AmqpValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The contained long, if this is a long value.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            AmqpValue::Long(value) => Some(*value),
            _ => None,
        }
    }
}

/// Message annotations: a symbol-keyed map of typed values.
pub type Annotations = BTreeMap<Symbol, AmqpValue>;

/// The properties section subset the messaging core uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Correlation-id, encoded as an AMQP string on the wire.
    pub correlation_id: Option<String>,
}

/// An AMQP message.
///
/// The body is a sequence of data sections; twin payloads occupy exactly
/// one. Bodies are [`Bytes`], so cloning a message for the send queue is
/// cheap and the queued copy is immutable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpMessage {
    properties: Option<Properties>,
    message_annotations: Option<Annotations>,
    body: Vec<Bytes>,
}

impl AmqpMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// The message correlation-id, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .as_ref()
            .and_then(|p| p.correlation_id.as_deref())
    }

    /// Set the message correlation-id.
    pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
        self.properties
            .get_or_insert_with(Properties::default)
            .correlation_id = Some(correlation_id.into());
    }

    /// The message annotations, if any.
    pub fn message_annotations(&self) -> Option<&Annotations> {
        self.message_annotations.as_ref()
    }

    /// Replace the message annotations.
    pub fn set_message_annotations(&mut self, annotations: Annotations) {
        self.message_annotations = Some(annotations);
    }

    /// Look up a single annotation by symbol name.
    pub fn annotation(&self, name: &str) -> Option<&AmqpValue> {
        self.message_annotations
            .as_ref()
            .and_then(|a| a.get(&Symbol::from(name)))
    }

    /// Number of body data sections.
    pub fn body_section_count(&self) -> usize {
        self.body.len()
    }

    /// Borrow one body data section in place.
    pub fn body_section(&self, index: usize) -> Option<&Bytes> {
        self.body.get(index)
    }

    /// Append a body data section.
    pub fn add_body_data(&mut self, data: Bytes) {
        self.body.push(data);
    }
}
