//! Twin messenger state machines and public API.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use bytes::Bytes;
use hublink_core::{AmqpMessage, Session, TimeProvider};
use uuid::Uuid;

use crate::error::{MessengerError, MessengerResult};
use crate::messenger::{
    AmqpMessenger, DispositionResult, LinkConfig, MessageReceivedCallback, MessengerConfig,
    MessengerState, SendStatus, StateChangedCallback,
};
use crate::queue::{SendCompleteCallback, SendCompletion};
use crate::twin::envelope::{
    self, IncomingTwinMessage, TwinOperationKind, API_VERSION, API_VERSION_PROPERTY,
    CHANNEL_CORRELATION_ID_PROPERTY, CLIENT_VERSION_PROPERTY,
};

/// Link suffix used for both twin directions.
const TWIN_LINK_SUFFIX: &str = "twin/";

/// Cumulative subscription failures tolerated before giving up.
const MAX_SUBSCRIPTION_ERROR_COUNT: u32 = 3;

/// Twin messenger lifecycle state, projected from the embedded AMQP
/// messenger's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinState {
    /// Idle; only `start` is accepted.
    Stopped,
    /// Teardown in progress.
    Stopping,
    /// Links coming up.
    Starting,
    /// Requests flow.
    Started,
    /// Unrecoverable.
    Error,
}

/// Desired-property subscription progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscription requested.
    NotSubscribed,
    /// Intent: fetch the complete twin document.
    GetCompleteProperties,
    /// GET request in flight.
    GettingCompleteProperties,
    /// Intent: subscribe for desired-property updates.
    SubscribeForUpdates,
    /// PUT request in flight.
    Subscribing,
    /// Updates flowing.
    Subscribed,
    /// Intent: unsubscribe.
    Unsubscribe,
    /// DELETE request in flight.
    Unsubscribing,
}

/// Kind of twin document update delivered to the user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateKind {
    /// The complete twin document (GET response).
    Complete,
    /// A desired-properties delta.
    Partial,
}

/// Why a report-state request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStateReason {
    /// The response carried no status code.
    InvalidResponse,
    /// The request could not be sent.
    FailSending,
    /// The request timed out in the send queue.
    Timeout,
}

/// Terminal outcome of a report-state request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStateOutcome {
    /// The service acknowledged the patch.
    Success {
        /// Status code from the response annotations.
        status_code: i32,
    },
    /// The request failed.
    Error(ReportStateReason),
    /// The messenger was destroyed before the request completed.
    Cancelled,
}

/// Callback invoked exactly once per report-state request.
pub type ReportStateCallback = Box<dyn FnOnce(ReportStateOutcome)>;

/// Callback receiving twin document updates.
pub type TwinUpdateCallback = Box<dyn FnMut(TwinUpdateKind, &[u8])>;

/// Callback observing twin messenger state transitions (previous, new).
pub type TwinStateChangedCallback = Box<dyn FnMut(TwinState, TwinState)>;

/// Configuration for a [`TwinMessenger`].
#[derive(Debug, Clone)]
pub struct TwinConfig {
    /// Client version string the host advertises.
    pub client_version: String,
    /// Device identity.
    pub device_id: String,
    /// Fully qualified hostname of the service.
    pub host_fqdn: String,
}

/// One outstanding twin request.
struct TwinOperation {
    kind: TwinOperationKind,
    correlation_id: String,
    on_report_complete: Option<ReportStateCallback>,
}

/// State shared with the callbacks threaded through the AMQP messenger.
struct TwinCore {
    device_id: String,
    state: TwinState,
    on_state_changed: Option<TwinStateChangedCallback>,
    subscription: SubscriptionState,
    subscription_error_count: u32,
    operations: Vec<TwinOperation>,
    on_update: Option<TwinUpdateCallback>,
    /// Set when the DELETE response confirms; the next tick drops the
    /// message subscription so the receiver link is torn down.
    drop_message_subscription: bool,
}

impl TwinCore {
    fn remove_operation(&mut self, correlation_id: &str) -> Option<TwinOperation> {
        let index = self
            .operations
            .iter()
            .position(|op| op.correlation_id == correlation_id)?;
        Some(self.operations.remove(index))
    }

    fn take_drop_subscription(&mut self) -> bool {
        std::mem::take(&mut self.drop_message_subscription)
    }
}

/// Twin messenger.
///
/// Wraps an [`AmqpMessenger`] configured with the twin link pair and
/// adds request correlation, the subscription state machine, and the
/// twin envelope translation. Driven by [`TwinMessenger::do_work`].
pub struct TwinMessenger<S: Session, T: TimeProvider> {
    core: Rc<RefCell<TwinCore>>,
    messenger: AmqpMessenger<S, T>,
}

impl<S: Session, T: TimeProvider> TwinMessenger<S, T> {
    /// Create a twin messenger in the Stopped state.
    ///
    /// Builds the embedded AMQP messenger with `twin/` link suffixes and
    /// the twin attach properties (client version, a fresh
    /// `twin:<uuid>` channel correlation-id, and the API version).
    pub fn new(
        config: TwinConfig,
        time: T,
        on_state_changed: Option<TwinStateChangedCallback>,
    ) -> MessengerResult<Self> {
        if config.client_version.is_empty() {
            return Err(MessengerError::InvalidConfig("client_version is empty"));
        }
        if config.device_id.is_empty() {
            return Err(MessengerError::InvalidConfig("device_id is empty"));
        }
        if config.host_fqdn.is_empty() {
            return Err(MessengerError::InvalidConfig("host_fqdn is empty"));
        }

        let core = Rc::new(RefCell::new(TwinCore {
            device_id: config.device_id.clone(),
            state: TwinState::Stopped,
            on_state_changed,
            subscription: SubscriptionState::NotSubscribed,
            subscription_error_count: 0,
            operations: Vec::new(),
            on_update: None,
            drop_message_subscription: false,
        }));

        let attach_properties = build_attach_properties(&config.client_version);
        let messenger_config = MessengerConfig {
            client_version: config.client_version,
            device_id: config.device_id,
            host_fqdn: config.host_fqdn,
            send_link: LinkConfig {
                target_suffix: TWIN_LINK_SUFFIX.to_owned(),
                attach_properties: attach_properties.clone(),
                ..LinkConfig::default()
            },
            receive_link: LinkConfig {
                source_suffix: TWIN_LINK_SUFFIX.to_owned(),
                attach_properties,
                ..LinkConfig::default()
            },
        };

        let sink_core = Rc::clone(&core);
        let on_messenger_state_changed: StateChangedCallback =
            Box::new(move |_previous, new_state| {
                update_state(&sink_core, project_state(new_state));
            });

        let messenger =
            AmqpMessenger::new(messenger_config, time, Some(on_messenger_state_changed))?;

        Ok(Self { core, messenger })
    }

    /// Current twin messenger state.
    pub fn state(&self) -> TwinState {
        self.core.borrow().state
    }

    /// Current subscription state.
    pub fn subscription_state(&self) -> SubscriptionState {
        self.core.borrow().subscription
    }

    /// Start the embedded messenger on the given session.
    pub fn start(&mut self, session: S) -> MessengerResult<()> {
        self.messenger.start(session)
    }

    /// Stop the embedded messenger.
    pub fn stop(&mut self) -> MessengerResult<()> {
        self.messenger.stop()
    }

    /// One twin tick: drive the subscription cycle, apply a deferred
    /// receiver teardown, then tick the embedded messenger.
    pub fn do_work(&mut self) {
        if self.core.borrow_mut().take_drop_subscription() {
            self.messenger.unsubscribe_for_messages();
        }
        self.process_subscription();
        self.messenger.do_work();
    }

    /// Queue a reported-properties PATCH.
    ///
    /// `on_complete` fires exactly once: with the response status code,
    /// with an error, or with Cancelled if the messenger is destroyed
    /// first.
    pub fn report_state_async(&mut self, data: Bytes, on_complete: ReportStateCallback) {
        let correlation_id = Uuid::new_v4().to_string();
        tracing::debug!(device_id = %self.core.borrow().device_id, %correlation_id,
            "queueing reported-state patch");
        self.core.borrow_mut().operations.push(TwinOperation {
            kind: TwinOperationKind::Patch,
            correlation_id: correlation_id.clone(),
            on_report_complete: Some(on_complete),
        });
        let message = envelope::build_request(TwinOperationKind::Patch, &correlation_id, Some(data));
        let on_send_complete = self.make_send_completion(TwinOperationKind::Patch, correlation_id);
        self.messenger.send_async(message, on_send_complete);
    }

    /// Subscribe for twin updates.
    ///
    /// Kicks off the GET → PUT subscription cycle on subsequent ticks.
    /// A no-op when a cycle is already underway.
    pub fn subscribe(&mut self, on_update: TwinUpdateCallback) {
        {
            let mut core = self.core.borrow_mut();
            if core.subscription != SubscriptionState::NotSubscribed {
                return;
            }
            core.on_update = Some(on_update);
        }

        let receive_core = Rc::clone(&self.core);
        let on_received: MessageReceivedCallback = Box::new(move |message, disposition_info| {
            // The handle is consumed synchronously; the returned result
            // settles the delivery.
            drop(disposition_info);
            on_twin_message_received(&receive_core, &message)
        });
        self.messenger.subscribe_for_messages(on_received);

        self.core.borrow_mut().subscription = SubscriptionState::GetCompleteProperties;
    }

    /// Unsubscribe from twin updates.
    ///
    /// Clears the update callback immediately; the DELETE request goes
    /// out on the next tick, and the receiver link is torn down once
    /// the service confirms.
    pub fn unsubscribe(&mut self) {
        let mut core = self.core.borrow_mut();
        if core.subscription == SubscriptionState::NotSubscribed {
            return;
        }
        core.on_update = None;
        core.subscription = SubscriptionState::Unsubscribe;
    }

    /// Busy while any PATCH awaits its response.
    pub fn send_status(&self) -> SendStatus {
        let pending_patches = self
            .core
            .borrow()
            .operations
            .iter()
            .filter(|op| op.kind == TwinOperationKind::Patch)
            .count();
        if pending_patches > 0 {
            SendStatus::Busy
        } else {
            SendStatus::Idle
        }
    }

    /// Forward a named option to the embedded messenger.
    pub fn set_option(&mut self, name: &str, value: &serde_json::Value) -> MessengerResult<()> {
        self.messenger.set_option(name, value)
    }

    /// Export the embedded messenger's options.
    pub fn retrieve_options(&self) -> serde_json::Map<String, serde_json::Value> {
        self.messenger.retrieve_options()
    }

    /// Advance the subscription state machine by one step.
    fn process_subscription(&mut self) {
        let decision = {
            let core = self.core.borrow();
            if core.subscription_error_count >= MAX_SUBSCRIPTION_ERROR_COUNT {
                tracing::error!(device_id = %core.device_id,
                    count = core.subscription_error_count,
                    "maximum number of twin subscription failures reached");
                Err(())
            } else {
                Ok(match core.subscription {
                    SubscriptionState::GetCompleteProperties => Some((
                        TwinOperationKind::Get,
                        SubscriptionState::GettingCompleteProperties,
                    )),
                    SubscriptionState::SubscribeForUpdates => {
                        Some((TwinOperationKind::Put, SubscriptionState::Subscribing))
                    }
                    SubscriptionState::Unsubscribe => {
                        Some((TwinOperationKind::Delete, SubscriptionState::Unsubscribing))
                    }
                    _ => None,
                })
            }
        };

        let (kind, in_flight) = match decision {
            Err(()) => {
                update_state(&self.core, TwinState::Error);
                return;
            }
            Ok(None) => return,
            Ok(Some(step)) => step,
        };

        let correlation_id = Uuid::new_v4().to_string();
        tracing::debug!(device_id = %self.core.borrow().device_id,
            operation = kind.wire_name(), %correlation_id, "sending twin subscription request");
        self.core.borrow_mut().operations.push(TwinOperation {
            kind,
            correlation_id: correlation_id.clone(),
            on_report_complete: None,
        });
        let message = envelope::build_request(kind, &correlation_id, None);
        let on_send_complete = self.make_send_completion(kind, correlation_id);
        self.messenger.send_async(message, on_send_complete);
        self.core.borrow_mut().subscription = in_flight;
    }

    /// Completion the AMQP messenger invokes for a twin request. Only
    /// failures are meaningful; success is confirmed by the correlated
    /// response.
    fn make_send_completion(
        &self,
        kind: TwinOperationKind,
        correlation_id: String,
    ) -> SendCompleteCallback {
        let core = Rc::clone(&self.core);
        Box::new(move |completion| {
            on_send_complete(&core, kind, &correlation_id, completion);
        })
    }
}

impl<S: Session, T: TimeProvider> Drop for TwinMessenger<S, T> {
    fn drop(&mut self) {
        // Cancel outstanding operations before the embedded messenger
        // cancels its queue, so each PATCH callback fires exactly once.
        let operations = std::mem::take(&mut self.core.borrow_mut().operations);
        for operation in operations {
            if let Some(on_report_complete) = operation.on_report_complete {
                on_report_complete(ReportStateOutcome::Cancelled);
            }
        }
    }
}

fn build_attach_properties(client_version: &str) -> BTreeMap<String, String> {
    let channel_correlation_id = format!("twin:{}", Uuid::new_v4());
    let mut properties = BTreeMap::new();
    properties.insert(CLIENT_VERSION_PROPERTY.to_owned(), client_version.to_owned());
    properties.insert(
        CHANNEL_CORRELATION_ID_PROPERTY.to_owned(),
        channel_correlation_id,
    );
    properties.insert(API_VERSION_PROPERTY.to_owned(), API_VERSION.to_owned());
    properties
}

fn project_state(messenger_state: MessengerState) -> TwinState {
    match messenger_state {
        MessengerState::Stopped => TwinState::Stopped,
        MessengerState::Stopping => TwinState::Stopping,
        MessengerState::Starting => TwinState::Starting,
        MessengerState::Started => TwinState::Started,
        MessengerState::Error => TwinState::Error,
    }
}

/// Transition the twin state, notifying the sink on real changes. The
/// sink is taken out for the duration of the call so it may re-enter.
fn update_state(core: &Rc<RefCell<TwinCore>>, new_state: TwinState) {
    let (previous_state, callback) = {
        let mut core = core.borrow_mut();
        if core.state == new_state {
            return;
        }
        let previous_state = core.state;
        core.state = new_state;
        tracing::debug!(device_id = %core.device_id, ?previous_state, ?new_state,
            "twin messenger state changed");
        (previous_state, core.on_state_changed.take())
    };
    if let Some(mut callback) = callback {
        callback(previous_state, new_state);
        let mut core = core.borrow_mut();
        if core.on_state_changed.is_none() {
            core.on_state_changed = Some(callback);
        }
    }
}

/// Deliver a twin document update to the user callback, if registered.
fn deliver_update(core: &Rc<RefCell<TwinCore>>, kind: TwinUpdateKind, payload: &[u8]) {
    let callback = core.borrow_mut().on_update.take();
    let Some(mut callback) = callback else {
        return;
    };
    callback(kind, payload);
    let mut core = core.borrow_mut();
    if core.on_update.is_none() {
        core.on_update = Some(callback);
    }
}

/// Send-completion for twin requests.
fn on_send_complete(
    core: &Rc<RefCell<TwinCore>>,
    kind: TwinOperationKind,
    correlation_id: &str,
    completion: SendCompletion,
) {
    if completion == SendCompletion::Ok {
        return;
    }

    let operation = {
        let mut core_ref = core.borrow_mut();
        let operation = core_ref.remove_operation(correlation_id);

        if completion != SendCompletion::Cancelled {
            tracing::error!(device_id = %core_ref.device_id, operation = kind.wire_name(),
                %correlation_id, ?completion, "failed sending twin request");
            // A failed subscription request falls back to its intent
            // state and counts against the error limit.
            match (kind, core_ref.subscription) {
                (TwinOperationKind::Get, SubscriptionState::GettingCompleteProperties) => {
                    core_ref.subscription = SubscriptionState::GetCompleteProperties;
                    core_ref.subscription_error_count += 1;
                }
                (TwinOperationKind::Put, SubscriptionState::Subscribing) => {
                    core_ref.subscription = SubscriptionState::SubscribeForUpdates;
                    core_ref.subscription_error_count += 1;
                }
                (TwinOperationKind::Delete, SubscriptionState::Unsubscribing) => {
                    core_ref.subscription = SubscriptionState::Unsubscribe;
                    core_ref.subscription_error_count += 1;
                }
                _ => {}
            }
        }

        operation
    };

    if let Some(operation) = operation {
        if let Some(on_report_complete) = operation.on_report_complete {
            on_report_complete(match completion {
                SendCompletion::FailSending => {
                    ReportStateOutcome::Error(ReportStateReason::FailSending)
                }
                SendCompletion::TimedOut => ReportStateOutcome::Error(ReportStateReason::Timeout),
                SendCompletion::Cancelled => ReportStateOutcome::Cancelled,
                SendCompletion::Ok => return,
            });
        }
    }
}

/// Dispatch one inbound twin message and choose its disposition.
fn on_twin_message_received(
    core: &Rc<RefCell<TwinCore>>,
    message: &AmqpMessage,
) -> DispositionResult {
    let mut parsed = match envelope::parse_incoming(message) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::error!(device_id = %core.borrow().device_id, %error,
                "failed parsing incoming twin message");
            return DispositionResult::Rejected;
        }
    };

    match parsed.correlation_id.take() {
        Some(correlation_id) => handle_correlated_response(core, &correlation_id, parsed),
        None => {
            if let Some(body) = parsed.body {
                // Desired-properties delta.
                tracing::debug!(device_id = %core.borrow().device_id, version = ?parsed.version,
                    "desired properties delta received");
                deliver_update(core, TwinUpdateKind::Partial, &body);
            } else {
                tracing::error!(device_id = %core.borrow().device_id,
                    "twin message carried neither correlation-id nor body");
            }
            DispositionResult::Accepted
        }
    }
}

/// Dispatch a response matched (or not) against the operations table.
fn handle_correlated_response(
    core: &Rc<RefCell<TwinCore>>,
    correlation_id: &str,
    parsed: IncomingTwinMessage,
) -> DispositionResult {
    let operation = core.borrow_mut().remove_operation(correlation_id);
    let Some(operation) = operation else {
        tracing::error!(device_id = %core.borrow().device_id, %correlation_id,
            "no matching operation for incoming twin message");
        return DispositionResult::Accepted;
    };

    match operation.kind {
        TwinOperationKind::Patch => match parsed.status_code {
            Some(status_code) => {
                if let Some(on_report_complete) = operation.on_report_complete {
                    on_report_complete(ReportStateOutcome::Success { status_code });
                }
                DispositionResult::Accepted
            }
            None => {
                tracing::error!(device_id = %core.borrow().device_id, %correlation_id,
                    "twin patch response carried no status code");
                if let Some(on_report_complete) = operation.on_report_complete {
                    on_report_complete(ReportStateOutcome::Error(
                        ReportStateReason::InvalidResponse,
                    ));
                }
                DispositionResult::Rejected
            }
        },
        TwinOperationKind::Get => match parsed.body {
            Some(body) => {
                deliver_update(core, TwinUpdateKind::Complete, &body);
                let mut core_ref = core.borrow_mut();
                if core_ref.subscription == SubscriptionState::GettingCompleteProperties {
                    core_ref.subscription = SubscriptionState::SubscribeForUpdates;
                    core_ref.subscription_error_count = 0;
                }
                DispositionResult::Accepted
            }
            None => {
                tracing::error!(device_id = %core.borrow().device_id, %correlation_id,
                    "twin get response carried no document");
                deliver_update(core, TwinUpdateKind::Complete, b"");
                let mut core_ref = core.borrow_mut();
                if core_ref.subscription == SubscriptionState::GettingCompleteProperties {
                    core_ref.subscription = SubscriptionState::GetCompleteProperties;
                    core_ref.subscription_error_count += 1;
                }
                DispositionResult::Rejected
            }
        },
        TwinOperationKind::Put => {
            let succeeded = status_is_success(parsed.status_code);
            if !succeeded {
                tracing::error!(device_id = %core.borrow().device_id, %correlation_id,
                    status = ?parsed.status_code, "twin subscription request failed");
            }
            let mut core_ref = core.borrow_mut();
            if core_ref.subscription == SubscriptionState::Subscribing {
                if succeeded {
                    core_ref.subscription = SubscriptionState::Subscribed;
                    core_ref.subscription_error_count = 0;
                } else {
                    core_ref.subscription = SubscriptionState::SubscribeForUpdates;
                    core_ref.subscription_error_count += 1;
                }
            }
            DispositionResult::Accepted
        }
        TwinOperationKind::Delete => {
            let succeeded = status_is_success(parsed.status_code);
            if !succeeded {
                tracing::error!(device_id = %core.borrow().device_id, %correlation_id,
                    status = ?parsed.status_code, "twin unsubscription request failed");
            }
            let mut core_ref = core.borrow_mut();
            if core_ref.subscription == SubscriptionState::Unsubscribing {
                if succeeded {
                    core_ref.subscription = SubscriptionState::NotSubscribed;
                    core_ref.subscription_error_count = 0;
                    core_ref.drop_message_subscription = true;
                } else {
                    core_ref.subscription = SubscriptionState::Unsubscribe;
                    core_ref.subscription_error_count += 1;
                }
            }
            DispositionResult::Accepted
        }
    }
}

fn status_is_success(status_code: Option<i32>) -> bool {
    matches!(status_code, Some(code) if (200..300).contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_projection_covers_all_messenger_states() {
        assert_eq!(project_state(MessengerState::Stopped), TwinState::Stopped);
        assert_eq!(project_state(MessengerState::Stopping), TwinState::Stopping);
        assert_eq!(project_state(MessengerState::Starting), TwinState::Starting);
        assert_eq!(project_state(MessengerState::Started), TwinState::Started);
        assert_eq!(project_state(MessengerState::Error), TwinState::Error);
    }

    #[test]
    fn test_attach_properties_shape() {
        let properties = build_attach_properties("client/1.0");
        assert_eq!(
            properties.get("com.microsoft:client-version").map(String::as_str),
            Some("client/1.0")
        );
        assert_eq!(
            properties.get("com.microsoft:api-version").map(String::as_str),
            Some("2016-11-14")
        );
        let channel = properties
            .get("com.microsoft:channel-correlation-id")
            .expect("channel correlation id");
        assert!(channel.starts_with("twin:"));
    }

    #[test]
    fn test_channel_correlation_ids_are_fresh() {
        let first = build_attach_properties("v");
        let second = build_attach_properties("v");
        assert_ne!(
            first.get("com.microsoft:channel-correlation-id"),
            second.get("com.microsoft:channel-correlation-id")
        );
    }

    #[test]
    fn test_status_success_window() {
        assert!(status_is_success(Some(200)));
        assert!(status_is_success(Some(204)));
        assert!(status_is_success(Some(299)));
        assert!(!status_is_success(Some(300)));
        assert!(!status_is_success(Some(199)));
        assert!(!status_is_success(None));
    }
}
