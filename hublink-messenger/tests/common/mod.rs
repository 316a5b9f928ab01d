//! Shared test support: a scripted in-memory AMQP fake and a manual clock.
//!
//! The fake hub plays the role of the wire library. Tests control link
//! states, settle outbound deliveries, inject inbound deliveries, and
//! inspect everything the messenger did.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use hublink_core::{
    AmqpError, AmqpMessage, DeliveryCallback, DeliveryNumber, DeliveryOutcome, LinkDefinition,
    LinkState, MessageReceiver, MessageSender, SendOutcome, Session, SettleCallback, TimeProvider,
};

/// Manually advanced clock.
#[derive(Clone, Default)]
pub struct ManualTime {
    now: Rc<Cell<Duration>>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl TimeProvider for ManualTime {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Observable state of one fake sender endpoint.
pub struct FakeSenderState {
    pub definition: LinkDefinition,
    pub state: LinkState,
    pub auto_open: bool,
    pub reject_sends: bool,
    pub sent: Vec<AmqpMessage>,
    pub settles: Vec<SettleCallback>,
}

/// Observable state of one fake receiver endpoint.
pub struct FakeReceiverState {
    pub definition: LinkDefinition,
    pub state: LinkState,
    pub auto_open: bool,
    pub on_delivery: Option<DeliveryCallback>,
    pub next_delivery_number: DeliveryNumber,
    pub dispositions: Vec<(String, DeliveryNumber, DeliveryOutcome)>,
    pub closed: bool,
}

struct HubState {
    senders: Vec<Rc<RefCell<FakeSenderState>>>,
    receivers: Vec<Rc<RefCell<FakeReceiverState>>>,
    fail_sender_create: bool,
    fail_receiver_create: bool,
    auto_open: bool,
}

/// Scripted in-memory session fake. Cloning shares the hub.
#[derive(Clone)]
pub struct FakeHub {
    state: Rc<RefCell<HubState>>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(HubState {
                senders: Vec::new(),
                receivers: Vec::new(),
                fail_sender_create: false,
                fail_receiver_create: false,
                auto_open: true,
            })),
        }
    }

    /// Newly created endpoints stay in Opening instead of opening
    /// immediately.
    pub fn set_auto_open(&self, auto_open: bool) {
        self.state.borrow_mut().auto_open = auto_open;
    }

    pub fn set_fail_receiver_create(&self, fail: bool) {
        self.state.borrow_mut().fail_receiver_create = fail;
    }

    pub fn sender_count(&self) -> usize {
        self.state.borrow().senders.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.state.borrow().receivers.len()
    }

    pub fn last_sender(&self) -> Rc<RefCell<FakeSenderState>> {
        self.state
            .borrow()
            .senders
            .last()
            .cloned()
            .expect("no sender created")
    }

    pub fn last_receiver(&self) -> Rc<RefCell<FakeReceiverState>> {
        self.state
            .borrow()
            .receivers
            .last()
            .cloned()
            .expect("no receiver created")
    }

    /// Messages handed to the most recent sender, in order.
    pub fn sent_messages(&self) -> Vec<AmqpMessage> {
        self.last_sender().borrow().sent.clone()
    }

    /// Settle every pending outbound delivery on the most recent sender,
    /// in send order.
    pub fn settle_all(&self, outcome: SendOutcome) {
        let settles: Vec<SettleCallback> = {
            let sender = self.last_sender();
            let mut sender = sender.borrow_mut();
            sender.settles.drain(..).collect()
        };
        for settle in settles {
            settle(outcome);
        }
    }

    /// Drive the most recent sender into the Error state and fail its
    /// in-flight deliveries, as a dying link would.
    pub fn kill_sender(&self) {
        let settles: Vec<SettleCallback> = {
            let sender = self.last_sender();
            let mut sender = sender.borrow_mut();
            sender.state = LinkState::Error;
            sender.settles.drain(..).collect()
        };
        for settle in settles {
            settle(SendOutcome::Error);
        }
    }

    /// Push one inbound delivery through the most recent receiver.
    /// Returns the synchronous disposition outcome, if any.
    pub fn deliver(&self, message: AmqpMessage) -> Option<DeliveryOutcome> {
        let receiver = self.last_receiver();
        let (mut on_delivery, delivery_number) = {
            let mut receiver = receiver.borrow_mut();
            let on_delivery = receiver.on_delivery.take().expect("receiver not open");
            let delivery_number = receiver.next_delivery_number;
            receiver.next_delivery_number += 1;
            (on_delivery, delivery_number)
        };
        let outcome = on_delivery(message, delivery_number);
        let mut receiver = receiver.borrow_mut();
        if receiver.on_delivery.is_none() {
            receiver.on_delivery = Some(on_delivery);
        }
        outcome
    }
}

impl Session for FakeHub {
    type Sender = FakeSender;
    type Receiver = FakeReceiver;

    fn create_sender(&self, definition: &LinkDefinition) -> Result<FakeSender, AmqpError> {
        let mut hub = self.state.borrow_mut();
        if hub.fail_sender_create {
            return Err(AmqpError::LinkCreate("scripted sender failure".into()));
        }
        let state = Rc::new(RefCell::new(FakeSenderState {
            definition: definition.clone(),
            state: LinkState::Idle,
            auto_open: hub.auto_open,
            reject_sends: false,
            sent: Vec::new(),
            settles: Vec::new(),
        }));
        hub.senders.push(Rc::clone(&state));
        Ok(FakeSender { state })
    }

    fn create_receiver(&self, definition: &LinkDefinition) -> Result<FakeReceiver, AmqpError> {
        let mut hub = self.state.borrow_mut();
        if hub.fail_receiver_create {
            return Err(AmqpError::LinkCreate("scripted receiver failure".into()));
        }
        let state = Rc::new(RefCell::new(FakeReceiverState {
            definition: definition.clone(),
            state: LinkState::Idle,
            auto_open: hub.auto_open,
            on_delivery: None,
            next_delivery_number: 0,
            dispositions: Vec::new(),
            closed: false,
        }));
        hub.receivers.push(Rc::clone(&state));
        Ok(FakeReceiver { state })
    }
}

pub struct FakeSender {
    state: Rc<RefCell<FakeSenderState>>,
}

impl MessageSender for FakeSender {
    fn open(&mut self) -> Result<(), AmqpError> {
        let mut state = self.state.borrow_mut();
        state.state = if state.auto_open {
            LinkState::Open
        } else {
            LinkState::Opening
        };
        Ok(())
    }

    fn state(&self) -> LinkState {
        self.state.borrow().state
    }

    fn send(
        &mut self,
        message: AmqpMessage,
        on_settled: SettleCallback,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.borrow_mut();
        if state.reject_sends {
            return Err(AmqpError::SendRefused("scripted send refusal".into()));
        }
        state.sent.push(message);
        state.settles.push(on_settled);
        Ok(())
    }
}

pub struct FakeReceiver {
    state: Rc<RefCell<FakeReceiverState>>,
}

impl MessageReceiver for FakeReceiver {
    fn open(&mut self, on_delivery: DeliveryCallback) -> Result<(), AmqpError> {
        let mut state = self.state.borrow_mut();
        state.state = if state.auto_open {
            LinkState::Open
        } else {
            LinkState::Opening
        };
        state.on_delivery = Some(on_delivery);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AmqpError> {
        let mut state = self.state.borrow_mut();
        state.state = LinkState::Idle;
        state.closed = true;
        state.on_delivery = None;
        Ok(())
    }

    fn state(&self) -> LinkState {
        self.state.borrow().state
    }

    fn send_disposition(
        &mut self,
        source_link: &str,
        delivery_number: DeliveryNumber,
        outcome: &DeliveryOutcome,
    ) -> Result<(), AmqpError> {
        self.state.borrow_mut().dispositions.push((
            source_link.to_owned(),
            delivery_number,
            outcome.clone(),
        ));
        Ok(())
    }
}
