//! Messenger state machine and tick loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use hublink_core::{
    AmqpMessage, AmqpValue, DeliveryCallback, DeliveryNumber, DeliveryOutcome, LinkDefinition,
    LinkRole, LinkState, MessageReceiver, MessageSender, Session, SettleCallback, Symbol,
    TimeProvider,
};
use uuid::Uuid;

use crate::error::{MessengerError, MessengerResult};
use crate::messenger::config::{
    MessengerConfig, OPTION_EVENT_SEND_TIMEOUT_SECS, OPTION_MESSAGE_QUEUE_OPTIONS,
};
use crate::queue::{QueueOptions, SendCompleteCallback, SendCompletion, SendQueue};

const SEND_LINK_NAME_PREFIX: &str = "link-snd";
const RECEIVE_LINK_NAME_PREFIX: &str = "link-rcv";

const SENDER_MAX_LINK_SIZE: u64 = u64::MAX;
const RECEIVER_MAX_LINK_SIZE: u64 = 65536;

const DEFAULT_MAX_SEND_ERROR_COUNT: u32 = 10;

const MAX_SENDER_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RECEIVER_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(300);

const REJECTED_BY_APPLICATION: &str = "Rejected by application";

/// Top-level messenger lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    /// Session recorded, links not open yet.
    Starting,
    /// Sender observed open; sends flow.
    Started,
    /// Teardown in progress.
    Stopping,
    /// Idle; only `start` is accepted.
    Stopped,
    /// Unrecoverable; only `stop` makes progress.
    Error,
}

/// Send-queue occupancy as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// No messages queued or in flight.
    Idle,
    /// At least one message queued or in flight.
    Busy,
}

/// Disposition the receive callback applies to an inbound delivery.
///
/// `None` defers settlement: the callback keeps the
/// [`DispositionInfo`] and settles later through
/// [`AmqpMessenger::send_message_disposition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionResult {
    /// Settle later.
    None,
    /// Accept the delivery.
    Accepted,
    /// Reject the delivery.
    Rejected,
    /// Release the delivery back to the service.
    Released,
}

/// Owned reference to one inbound delivery.
///
/// Copied out of the wire library's borrowed storage at dispatch time;
/// the holder may keep it arbitrarily long before settling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionInfo {
    /// Delivery number on the source link.
    pub delivery_number: DeliveryNumber,
    /// Name of the link the delivery arrived on.
    pub source: String,
}

/// Callback observing messenger state transitions (previous, new).
pub type StateChangedCallback = Box<dyn FnMut(MessengerState, MessengerState)>;

/// Callback handling one inbound delivery and choosing its disposition.
pub type MessageReceivedCallback =
    Box<dyn FnMut(AmqpMessage, DispositionInfo) -> DispositionResult>;

/// The registered receive callback plus the subscription intent.
///
/// Shared with the receiver-side dispatch closure; the callback is
/// taken out for the duration of each invocation so user code may
/// re-enter the messenger.
struct ReceiveHook {
    wanted: bool,
    callback: Option<MessageReceivedCallback>,
}

/// Per-device AMQP messenger.
///
/// Multiplexes one outbound queued send-stream and one optional inbound
/// delivery stream over a pair of links on a caller-supplied session.
/// Not thread-safe: the host drives it from a single event loop.
pub struct AmqpMessenger<S: Session, T: TimeProvider> {
    config: MessengerConfig,
    time: T,
    state: MessengerState,
    on_state_changed: Option<StateChangedCallback>,

    session: Option<S>,

    sender: Option<S::Sender>,
    sender_observed: LinkState,
    sender_observed_at: Option<Duration>,

    receiver: Option<S::Receiver>,
    receiver_observed: LinkState,
    receiver_observed_at: Option<Duration>,

    receive_hook: Rc<RefCell<ReceiveHook>>,

    queue: SendQueue,
    send_error_count: Rc<Cell<u32>>,
    max_send_error_count: u32,
}

impl<S: Session, T: TimeProvider> AmqpMessenger<S, T> {
    /// Create a messenger in the Stopped state.
    ///
    /// Validates the configuration and initializes the send queue with
    /// its defaults (600 s enqueue-age limit, no retries).
    pub fn new(
        config: MessengerConfig,
        time: T,
        on_state_changed: Option<StateChangedCallback>,
    ) -> MessengerResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            time,
            state: MessengerState::Stopped,
            on_state_changed,
            session: None,
            sender: None,
            sender_observed: LinkState::Idle,
            sender_observed_at: None,
            receiver: None,
            receiver_observed: LinkState::Idle,
            receiver_observed_at: None,
            receive_hook: Rc::new(RefCell::new(ReceiveHook {
                wanted: false,
                callback: None,
            })),
            queue: SendQueue::new(QueueOptions::default()),
            send_error_count: Rc::new(Cell::new(0)),
            max_send_error_count: DEFAULT_MAX_SEND_ERROR_COUNT,
        })
    }

    /// Current messenger state.
    pub fn state(&self) -> MessengerState {
        self.state
    }

    /// Record the session and transition to Starting.
    ///
    /// Links are created lazily on the next tick.
    pub fn start(&mut self, session: S) -> MessengerResult<()> {
        if self.state != MessengerState::Stopped {
            tracing::error!(state = ?self.state, "start refused");
            return Err(MessengerError::BadState { state: self.state });
        }
        self.session = Some(session);
        self.send_error_count.set(0);
        self.update_state(MessengerState::Starting);
        Ok(())
    }

    /// Tear down both links and requeue in-flight messages.
    ///
    /// In-progress queue entries go back to the front of pending in
    /// their original order, ready for the next start.
    pub fn stop(&mut self) -> MessengerResult<()> {
        if self.state == MessengerState::Stopped {
            tracing::error!("stop refused (messenger is already stopped)");
            return Err(MessengerError::BadState { state: self.state });
        }
        self.update_state(MessengerState::Stopping);
        self.destroy_message_sender();
        self.destroy_message_receiver();
        self.queue.move_all_back_to_pending();
        self.session = None;
        self.update_state(MessengerState::Stopped);
        Ok(())
    }

    /// Queue a message for sending.
    ///
    /// The message is cloned into the queue; `on_complete` fires exactly
    /// once later with Ok, FailSending, TimedOut, or Cancelled.
    pub fn send_async(&mut self, message: AmqpMessage, on_complete: SendCompleteCallback) {
        let errors = Rc::clone(&self.send_error_count);
        let wrapped: SendCompleteCallback = Box::new(move |completion| {
            match completion {
                SendCompletion::Ok => errors.set(0),
                SendCompletion::FailSending => errors.set(errors.get().saturating_add(1)),
                SendCompletion::TimedOut | SendCompletion::Cancelled => {}
            }
            on_complete(completion);
        });
        let now = self.time.now();
        self.queue.add(message, wrapped, now);
    }

    /// Busy while any queued message awaits its completion.
    pub fn send_status(&self) -> SendStatus {
        if self.queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Register the receive callback. The receiver link is created on
    /// the next tick while Started.
    pub fn subscribe_for_messages(&mut self, on_received: MessageReceivedCallback) {
        let mut hook = self.receive_hook.borrow_mut();
        hook.wanted = true;
        hook.callback = Some(on_received);
    }

    /// Clear the receive callback. The receiver link is torn down on the
    /// next tick.
    pub fn unsubscribe_for_messages(&mut self) {
        let mut hook = self.receive_hook.borrow_mut();
        hook.wanted = false;
        hook.callback = None;
    }

    /// Settle a previously unsettled inbound delivery.
    ///
    /// Consumes the disposition handle. `DispositionResult::None` is a
    /// no-op. Fails when no receiver link exists.
    pub fn send_message_disposition(
        &mut self,
        disposition_info: DispositionInfo,
        disposition_result: DispositionResult,
    ) -> MessengerResult<()> {
        if disposition_info.source.is_empty() {
            return Err(MessengerError::InvalidArgument("disposition source is empty"));
        }
        let Some(receiver) = self.receiver.as_mut() else {
            tracing::error!("disposition refused (no message receiver; check subscription)");
            return Err(MessengerError::NoReceiver);
        };
        match to_delivery_outcome(disposition_result) {
            None => Ok(()),
            Some(outcome) => {
                receiver.send_disposition(
                    &disposition_info.source,
                    disposition_info.delivery_number,
                    &outcome,
                )?;
                Ok(())
            }
        }
    }

    /// Apply a single named option.
    pub fn set_option(&mut self, name: &str, value: &serde_json::Value) -> MessengerResult<()> {
        match name {
            OPTION_EVENT_SEND_TIMEOUT_SECS => {
                let seconds = value
                    .as_u64()
                    .ok_or_else(|| MessengerError::InvalidOptionValue(name.to_owned()))?;
                self.queue.set_max_enqueued_time_secs(seconds);
                Ok(())
            }
            OPTION_MESSAGE_QUEUE_OPTIONS => {
                let options: QueueOptions = serde_json::from_value(value.clone())
                    .map_err(|_| MessengerError::InvalidOptionValue(name.to_owned()))?;
                self.queue.apply_options(options);
                Ok(())
            }
            _ => {
                tracing::error!(name, "option is not supported");
                Err(MessengerError::UnsupportedOption(name.to_owned()))
            }
        }
    }

    /// Export the current options as an opaque name → value map.
    ///
    /// Feeding every entry back through [`AmqpMessenger::set_option`] on
    /// a fresh instance reproduces the effective configuration.
    pub fn retrieve_options(&self) -> serde_json::Map<String, serde_json::Value> {
        let options = self.queue.options();
        let mut map = serde_json::Map::new();
        map.insert(
            OPTION_MESSAGE_QUEUE_OPTIONS.to_owned(),
            serde_json::json!({
                "max_message_enqueued_time_secs": options.max_message_enqueued_time_secs,
                "max_retry_count": options.max_retry_count,
            }),
        );
        map
    }

    /// One messenger tick.
    ///
    /// Observes endpoint states, applies lifecycle transitions, creates
    /// or destroys links as the state requires, drives the send queue
    /// while the sender is open, sweeps enqueue-age timeouts, and trips
    /// the consecutive-send-error limit.
    pub fn do_work(&mut self) {
        if self.state == MessengerState::Stopped {
            return;
        }

        self.observe_endpoint_states();
        self.process_state_changes();

        match self.state {
            MessengerState::Starting => {
                if self.sender.is_none() {
                    if let Err(error) = self.create_message_sender() {
                        tracing::error!(%error, device_id = %self.config.device_id,
                            "failed creating the message sender");
                        self.update_state(MessengerState::Error);
                    }
                }
            }
            MessengerState::Started => {
                let wanted = self.receive_hook.borrow().wanted;
                if wanted && self.receiver.is_none() {
                    if let Err(error) = self.create_message_receiver() {
                        // Retried on the next tick.
                        tracing::warn!(%error, device_id = %self.config.device_id,
                            "failed creating the message receiver");
                    }
                } else if !wanted && self.receiver.is_some() {
                    self.destroy_message_receiver();
                }
            }
            _ => {}
        }

        let now = self.time.now();
        let mut dispatched = false;
        if self.state == MessengerState::Started {
            let Self { sender, queue, .. } = self;
            if let Some(sender) = sender.as_mut() {
                if sender.state() == LinkState::Open {
                    let mut dispatch = |message: AmqpMessage, on_settled: SettleCallback| {
                        sender.send(message, on_settled)
                    };
                    queue.do_work(now, Some(&mut dispatch));
                    dispatched = true;
                }
            }
        }
        if !dispatched {
            self.queue.do_work(now, None);
        }

        if self.send_error_count.get() >= self.max_send_error_count {
            tracing::error!(
                count = self.send_error_count.get(),
                "reached max number of consecutive send failures"
            );
            self.update_state(MessengerState::Error);
        }
    }

    fn update_state(&mut self, new_state: MessengerState) {
        if new_state == self.state {
            return;
        }
        let previous_state = self.state;
        self.state = new_state;
        tracing::debug!(device_id = %self.config.device_id, ?previous_state, ?new_state,
            "messenger state changed");
        if let Some(on_state_changed) = self.on_state_changed.as_mut() {
            on_state_changed(previous_state, new_state);
        }
    }

    /// Record endpoint states as reported by the wire library, stamping
    /// the first observation of each change.
    fn observe_endpoint_states(&mut self) {
        let now = self.time.now();
        if let Some(sender) = self.sender.as_ref() {
            let current = sender.state();
            if current != self.sender_observed {
                tracing::debug!(previous = ?self.sender_observed, ?current,
                    "message sender state changed");
                self.sender_observed = current;
                self.sender_observed_at = Some(now);
            }
        }
        if let Some(receiver) = self.receiver.as_ref() {
            let current = receiver.state();
            if current != self.receiver_observed {
                tracing::debug!(previous = ?self.receiver_observed, ?current,
                    "message receiver state changed");
                self.receiver_observed = current;
                self.receiver_observed_at = Some(now);
            }
        }
    }

    /// Project the observed endpoint states onto the messenger state.
    fn process_state_changes(&mut self) {
        // The sender and receiver do not exist while Stopped, and are
        // destroyed synchronously on stop, so only the two active states
        // need watching.
        let now = self.time.now();
        match self.state {
            MessengerState::Started => {
                if self.sender_observed != LinkState::Open {
                    tracing::error!(state = ?self.sender_observed,
                        "message sender reported unexpected state while messenger was started");
                    self.update_state(MessengerState::Error);
                } else if self.receiver.is_some() && self.receiver_observed != LinkState::Open {
                    match self.receiver_observed {
                        LinkState::Opening => {
                            if timeout_reached(
                                self.receiver_observed_at,
                                MAX_RECEIVER_STATE_CHANGE_TIMEOUT,
                                now,
                            ) {
                                tracing::error!(
                                    timeout_secs = MAX_RECEIVER_STATE_CHANGE_TIMEOUT.as_secs(),
                                    "message receiver failed to start within the expected timeout"
                                );
                                self.update_state(MessengerState::Error);
                            }
                        }
                        LinkState::Error | LinkState::Idle => {
                            tracing::error!(state = ?self.receiver_observed,
                                "message receiver reported unexpected state");
                            self.update_state(MessengerState::Error);
                        }
                        _ => {}
                    }
                }
            }
            MessengerState::Starting => match self.sender_observed {
                LinkState::Open => self.update_state(MessengerState::Started),
                LinkState::Opening => {
                    if timeout_reached(
                        self.sender_observed_at,
                        MAX_SENDER_STATE_CHANGE_TIMEOUT,
                        now,
                    ) {
                        tracing::error!(
                            timeout_secs = MAX_SENDER_STATE_CHANGE_TIMEOUT.as_secs(),
                            "message sender failed to start within the expected timeout"
                        );
                        self.update_state(MessengerState::Error);
                    }
                }
                LinkState::Error | LinkState::Closing => {
                    tracing::error!(state = ?self.sender_observed,
                        "message sender reported unexpected state while messenger is starting");
                    self.update_state(MessengerState::Error);
                }
                // Idle is only valid while the sender has not been
                // created yet.
                LinkState::Idle => {
                    if self.sender.is_some() {
                        tracing::error!(
                            "message sender reported unexpected idle state after creation"
                        );
                        self.update_state(MessengerState::Error);
                    }
                }
            },
            _ => {}
        }
    }

    fn create_message_sender(&mut self) -> MessengerResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(MessengerError::BadState { state: self.state });
        };
        let definition = build_link_definition(LinkRole::Sender, &self.config);
        tracing::debug!(link = %definition.name, target = %definition.target,
            "creating message sender");
        let mut sender = session.create_sender(&definition)?;
        sender.open()?;
        self.sender_observed = sender.state();
        self.sender_observed_at = Some(self.time.now());
        self.sender = Some(sender);
        Ok(())
    }

    fn destroy_message_sender(&mut self) {
        if self.sender.take().is_some() {
            self.sender_observed = LinkState::Idle;
            self.sender_observed_at = None;
        }
    }

    fn create_message_receiver(&mut self) -> MessengerResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(MessengerError::BadState { state: self.state });
        };
        let definition = build_link_definition(LinkRole::Receiver, &self.config);
        tracing::debug!(link = %definition.name, source = %definition.source,
            "creating message receiver");
        let mut receiver = session.create_receiver(&definition)?;

        let hook = Rc::clone(&self.receive_hook);
        let source_link = definition.name.clone();
        let on_delivery: DeliveryCallback = Box::new(move |message, delivery_number| {
            dispatch_delivery(&hook, &source_link, message, delivery_number)
        });
        receiver.open(on_delivery)?;

        self.receiver_observed = receiver.state();
        self.receiver_observed_at = Some(self.time.now());
        self.receiver = Some(receiver);
        Ok(())
    }

    fn destroy_message_receiver(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            if let Err(error) = receiver.close() {
                tracing::warn!(%error, "failed closing the message receiver (ignored)");
            }
            self.receiver_observed = LinkState::Idle;
            self.receiver_observed_at = None;
        }
    }
}

impl<S: Session, T: TimeProvider> Drop for AmqpMessenger<S, T> {
    fn drop(&mut self) {
        if self.state != MessengerState::Stopped {
            let _ = self.stop();
        }
        self.queue.cancel_all();
    }
}

/// Mint a disposition handle and hand one delivery to the registered
/// receive callback, mapping its intent to the wire outcome.
fn dispatch_delivery(
    hook: &Rc<RefCell<ReceiveHook>>,
    source_link: &str,
    message: AmqpMessage,
    delivery_number: DeliveryNumber,
) -> Option<DeliveryOutcome> {
    let callback = hook.borrow_mut().callback.take();
    let Some(mut callback) = callback else {
        // Unsubscribe raced the delivery; the receiver is torn down on
        // the next tick.
        tracing::warn!(delivery_number, "delivery with no receive callback, releasing");
        return Some(DeliveryOutcome::released());
    };

    let disposition_info = DispositionInfo {
        delivery_number,
        source: source_link.to_owned(),
    };
    let result = callback(message, disposition_info);

    let mut hook_ref = hook.borrow_mut();
    if hook_ref.wanted && hook_ref.callback.is_none() {
        hook_ref.callback = Some(callback);
    }

    to_delivery_outcome(result)
}

fn to_delivery_outcome(result: DispositionResult) -> Option<DeliveryOutcome> {
    match result {
        DispositionResult::None => None,
        DispositionResult::Accepted => Some(DeliveryOutcome::accepted()),
        DispositionResult::Rejected => Some(DeliveryOutcome::rejected(
            REJECTED_BY_APPLICATION,
            REJECTED_BY_APPLICATION,
        )),
        DispositionResult::Released => Some(DeliveryOutcome::released()),
    }
}

fn timeout_reached(observed_at: Option<Duration>, timeout: Duration, now: Duration) -> bool {
    match observed_at {
        Some(at) => now.saturating_sub(at) >= timeout,
        None => false,
    }
}

/// Assemble the link definition for one direction.
///
/// Sender: source is a synthetic local name, target is the service
/// address. Receiver: roles swap. Attach properties become symbol keys
/// with string values.
fn build_link_definition(role: LinkRole, config: &MessengerConfig) -> LinkDefinition {
    let link_config = match role {
        LinkRole::Sender => &config.send_link,
        LinkRole::Receiver => &config.receive_link,
    };
    let suffix = match role {
        LinkRole::Sender => &link_config.target_suffix,
        LinkRole::Receiver => &link_config.source_suffix,
    };
    let address = format!(
        "amqps://{}/devices/{}/{}",
        config.host_fqdn, config.device_id, suffix
    );
    let prefix = match role {
        LinkRole::Sender => SEND_LINK_NAME_PREFIX,
        LinkRole::Receiver => RECEIVE_LINK_NAME_PREFIX,
    };
    let name = format!("{}-{}-{}", prefix, config.device_id, Uuid::new_v4());
    let (source, target, max_message_size) = match role {
        LinkRole::Sender => (format!("{name}-source"), address, SENDER_MAX_LINK_SIZE),
        LinkRole::Receiver => (address, format!("{name}-target"), RECEIVER_MAX_LINK_SIZE),
    };
    let attach_properties = link_config
        .attach_properties
        .iter()
        .map(|(key, value)| (Symbol::new(key.clone()), AmqpValue::String(value.clone())))
        .collect();

    LinkDefinition {
        name,
        role,
        source,
        target,
        sender_settle_mode: link_config.sender_settle_mode,
        receiver_settle_mode: link_config.receiver_settle_mode,
        max_message_size,
        attach_properties,
    }
}
