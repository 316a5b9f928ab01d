//! Twin request/response envelope translation.
//!
//! A twin request is an AMQP message whose annotations name the
//! operation (and, where applicable, the resource), whose
//! correlation-id identifies the request, and whose body is a single
//! data section. Responses echo the correlation-id and carry `status`
//! (AMQP int) and `version` (AMQP long) annotations; annotation types
//! are enforced, mistyped responses are malformed.

use bytes::Bytes;
use hublink_core::{AmqpMessage, AmqpValue, Annotations, Symbol};
use thiserror::Error;

pub(crate) const CLIENT_VERSION_PROPERTY: &str = "com.microsoft:client-version";
pub(crate) const CHANNEL_CORRELATION_ID_PROPERTY: &str = "com.microsoft:channel-correlation-id";
pub(crate) const API_VERSION_PROPERTY: &str = "com.microsoft:api-version";
pub(crate) const API_VERSION: &str = "2016-11-14";

const OPERATION_PROPERTY: &str = "operation";
const RESOURCE_PROPERTY: &str = "resource";
const STATUS_PROPERTY: &str = "status";
const VERSION_PROPERTY: &str = "version";

const RESOURCE_REPORTED: &str = "/properties/reported";
const RESOURCE_DESIRED: &str = "/notifications/twin/properties/desired";

/// Body placed on GET/PUT/DELETE requests, which carry no payload.
const EMPTY_TWIN_BODY: &[u8] = b" ";

/// The four twin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinOperationKind {
    /// Report device properties.
    Patch,
    /// Fetch the complete twin document.
    Get,
    /// Subscribe for desired-property updates.
    Put,
    /// Unsubscribe from desired-property updates.
    Delete,
}

impl TwinOperationKind {
    /// Operation name as it appears in the message annotations.
    pub fn wire_name(&self) -> &'static str {
        match self {
            TwinOperationKind::Patch => "PATCH",
            TwinOperationKind::Get => "GET",
            TwinOperationKind::Put => "PUT",
            TwinOperationKind::Delete => "DELETE",
        }
    }
}

/// Build the AMQP message for one twin request.
///
/// PATCH addresses the reported-properties resource; PUT and DELETE
/// address the desired-property notification resource; GET names no
/// resource. A request without a payload carries a single space byte so
/// the body section is never empty.
pub(crate) fn build_request(
    kind: TwinOperationKind,
    correlation_id: &str,
    payload: Option<Bytes>,
) -> AmqpMessage {
    let mut annotations = Annotations::new();
    annotations.insert(
        Symbol::from(OPERATION_PROPERTY),
        AmqpValue::String(kind.wire_name().to_owned()),
    );
    match kind {
        TwinOperationKind::Patch => {
            annotations.insert(
                Symbol::from(RESOURCE_PROPERTY),
                AmqpValue::String(RESOURCE_REPORTED.to_owned()),
            );
        }
        TwinOperationKind::Put | TwinOperationKind::Delete => {
            annotations.insert(
                Symbol::from(RESOURCE_PROPERTY),
                AmqpValue::String(RESOURCE_DESIRED.to_owned()),
            );
        }
        TwinOperationKind::Get => {}
    }

    let mut message = AmqpMessage::new();
    message.set_message_annotations(annotations);
    message.set_correlation_id(correlation_id);
    message.add_body_data(payload.unwrap_or_else(|| Bytes::from_static(EMPTY_TWIN_BODY)));
    message
}

/// Decoded view of one inbound twin message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IncomingTwinMessage {
    pub correlation_id: Option<String>,
    pub status_code: Option<i32>,
    pub version: Option<i64>,
    pub body: Option<Bytes>,
}

/// Reasons an inbound twin message fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum TwinParseError {
    /// The `status` annotation was present but not an AMQP int.
    #[error("status annotation is not an int")]
    StatusNotInt,
    /// The `version` annotation was present but not an AMQP long.
    #[error("version annotation is not a long")]
    VersionNotLong,
    /// The body held more than one data section.
    #[error("unexpected number of body sections ({0})")]
    UnexpectedBodySections(usize),
}

/// Parse an inbound twin message.
pub(crate) fn parse_incoming(message: &AmqpMessage) -> Result<IncomingTwinMessage, TwinParseError> {
    let correlation_id = message.correlation_id().map(str::to_owned);

    let mut status_code = None;
    let mut version = None;
    if let Some(annotations) = message.message_annotations() {
        for (key, value) in annotations {
            match key.as_str() {
                STATUS_PROPERTY => {
                    status_code = Some(value.as_int().ok_or(TwinParseError::StatusNotInt)?);
                }
                VERSION_PROPERTY => {
                    version = Some(value.as_long().ok_or(TwinParseError::VersionNotLong)?);
                }
                other => {
                    tracing::debug!(annotation = other, "unrecognized twin message annotation");
                }
            }
        }
    }

    let body = match message.body_section_count() {
        0 => None,
        1 => message.body_section(0).cloned(),
        count => return Err(TwinParseError::UnexpectedBodySections(count)),
    };

    Ok(IncomingTwinMessage {
        correlation_id,
        status_code,
        version,
        body,
    })
}
