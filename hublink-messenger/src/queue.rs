//! Outbound send queue.
//!
//! FIFO queue of pending messages feeding one sender link. Entries move
//! from *pending* to *in progress* when the messenger offers a dispatch
//! function (the sender is open); they leave the queue exactly once,
//! through settlement, dispatch failure, enqueue-age timeout, requeue on
//! stop, or cancellation on destroy.
//!
//! Queue internals sit behind `Rc<RefCell<…>>` so the settle callback
//! handed to the wire library can complete its entry later without
//! borrowing the messenger. A settlement that arrives after its entry
//! already timed out or was requeued finds nothing to complete and is
//! ignored.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use hublink_core::{AmqpError, AmqpMessage, SendOutcome, SettleCallback};
use serde::{Deserialize, Serialize};

/// Default limit on how long a message may sit in the queue.
pub(crate) const DEFAULT_MAX_ENQUEUED_TIME_SECS: u64 = 600;

/// Default dispatch retry budget per message.
pub(crate) const DEFAULT_MAX_RETRY_COUNT: u32 = 0;

/// Terminal outcome of a queued send. Exactly one fires per accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCompletion {
    /// The delivery settled successfully.
    Ok,
    /// The sender refused the delivery or settled it with an error.
    FailSending,
    /// The message exceeded the configured enqueue age.
    TimedOut,
    /// The messenger was destroyed before the message could complete.
    Cancelled,
}

/// Callback invoked exactly once with the terminal outcome of a send.
pub type SendCompleteCallback = Box<dyn FnOnce(SendCompletion)>;

/// Dispatch function the messenger supplies while the sender is open.
pub type DispatchFn<'a> =
    &'a mut dyn FnMut(AmqpMessage, SettleCallback) -> Result<(), AmqpError>;

/// Queue tuning, round-tripped through the messenger options blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Maximum seconds a message may wait before failing with a timeout.
    /// Zero disables the sweep.
    pub max_message_enqueued_time_secs: u64,
    /// Dispatch retries granted to each message before it fails.
    pub max_retry_count: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_message_enqueued_time_secs: DEFAULT_MAX_ENQUEUED_TIME_SECS,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
        }
    }
}

struct Entry {
    message: AmqpMessage,
    enqueued_at: Duration,
    retries: u32,
    on_complete: Option<SendCompleteCallback>,
}

struct QueueInner {
    pending: VecDeque<Entry>,
    in_progress: VecDeque<(u64, Entry)>,
    next_id: u64,
    options: QueueOptions,
}

impl QueueInner {
    fn remove_in_progress(&mut self, id: u64) -> Option<Entry> {
        let index = self.in_progress.iter().position(|(entry_id, _)| *entry_id == id)?;
        self.in_progress.remove(index).map(|(_, entry)| entry)
    }
}

/// FIFO send queue with per-entry enqueue timestamps.
pub struct SendQueue {
    inner: Rc<RefCell<QueueInner>>,
}

impl SendQueue {
    /// Create an empty queue with the given options.
    pub fn new(options: QueueOptions) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                pending: VecDeque::new(),
                in_progress: VecDeque::new(),
                next_id: 0,
                options,
            })),
        }
    }

    /// Append a message to the pending list.
    ///
    /// `on_complete` fires exactly once with the entry's terminal outcome.
    pub fn add(&mut self, message: AmqpMessage, on_complete: SendCompleteCallback, now: Duration) {
        self.inner.borrow_mut().pending.push_back(Entry {
            message,
            enqueued_at: now,
            retries: 0,
            on_complete: Some(on_complete),
        });
    }

    /// True when neither pending nor in-progress entries exist.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.borrow();
        inner.pending.is_empty() && inner.in_progress.is_empty()
    }

    /// One queue tick: dispatch pending entries (when a dispatch function
    /// is supplied), then sweep enqueue-age timeouts across both lists.
    pub fn do_work(&mut self, now: Duration, dispatch: Option<DispatchFn<'_>>) {
        if let Some(dispatch) = dispatch {
            self.dispatch_pending(dispatch);
        }
        self.sweep_timeouts(now);
    }

    /// Move every in-progress entry back to the front of pending,
    /// preserving original submission order. Used on stop, so that
    /// unacknowledged messages survive into the next start.
    pub fn move_all_back_to_pending(&mut self) {
        let mut inner = self.inner.borrow_mut();
        let requeued: Vec<Entry> = inner
            .in_progress
            .drain(..)
            .map(|(_, entry)| entry)
            .collect();
        for entry in requeued.into_iter().rev() {
            inner.pending.push_front(entry);
        }
    }

    /// Fail every remaining entry with [`SendCompletion::Cancelled`].
    /// Destroy path only.
    pub fn cancel_all(&mut self) {
        let callbacks: Vec<SendCompleteCallback> = {
            let mut inner = self.inner.borrow_mut();
            let pending = inner.pending.drain(..).filter_map(|mut e| e.on_complete.take());
            let pending: Vec<_> = pending.collect();
            let in_progress: Vec<_> = inner
                .in_progress
                .drain(..)
                .filter_map(|(_, mut e)| e.on_complete.take())
                .collect();
            pending.into_iter().chain(in_progress).collect()
        };
        for on_complete in callbacks {
            on_complete(SendCompletion::Cancelled);
        }
    }

    /// Current queue options.
    pub fn options(&self) -> QueueOptions {
        self.inner.borrow().options
    }

    /// Replace the queue options wholesale.
    pub fn apply_options(&mut self, options: QueueOptions) {
        self.inner.borrow_mut().options = options;
    }

    /// Re-parameterize the enqueue-age limit.
    pub fn set_max_enqueued_time_secs(&mut self, seconds: u64) {
        self.inner.borrow_mut().options.max_message_enqueued_time_secs = seconds;
    }

    fn dispatch_pending(&mut self, dispatch: DispatchFn<'_>) {
        loop {
            let (id, message) = {
                let mut inner = self.inner.borrow_mut();
                let Some(entry) = inner.pending.pop_front() else {
                    break;
                };
                let id = inner.next_id;
                inner.next_id += 1;
                let message = entry.message.clone();
                inner.in_progress.push_back((id, entry));
                (id, message)
            };

            let settle_inner = Rc::clone(&self.inner);
            let on_settled: SettleCallback = Box::new(move |outcome| {
                complete_in_progress(&settle_inner, id, outcome);
            });

            if let Err(error) = dispatch(message, on_settled) {
                tracing::error!(%error, "failed handing message to the sender");
                fail_dispatch(&self.inner, id);
            }
        }
    }

    fn sweep_timeouts(&mut self, now: Duration) {
        let expired: Vec<SendCompleteCallback> = {
            let mut inner = self.inner.borrow_mut();
            let max_secs = inner.options.max_message_enqueued_time_secs;
            if max_secs == 0 {
                return;
            }
            let limit = Duration::from_secs(max_secs);
            let mut expired = Vec::new();

            let mut keep = VecDeque::with_capacity(inner.pending.len());
            for mut entry in inner.pending.drain(..) {
                if now.saturating_sub(entry.enqueued_at) > limit {
                    expired.extend(entry.on_complete.take());
                } else {
                    keep.push_back(entry);
                }
            }
            inner.pending = keep;

            let mut keep = VecDeque::with_capacity(inner.in_progress.len());
            for (id, mut entry) in inner.in_progress.drain(..) {
                if now.saturating_sub(entry.enqueued_at) > limit {
                    expired.extend(entry.on_complete.take());
                } else {
                    keep.push_back((id, entry));
                }
            }
            inner.in_progress = keep;

            expired
        };

        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "messages timed out in the send queue");
        }
        for on_complete in expired {
            on_complete(SendCompletion::TimedOut);
        }
    }
}

/// Terminal path for a settled delivery. No-op if the entry is gone
/// (timed out or requeued before the settlement arrived).
fn complete_in_progress(inner: &Rc<RefCell<QueueInner>>, id: u64, outcome: SendOutcome) {
    let on_complete = {
        let mut inner = inner.borrow_mut();
        match inner.remove_in_progress(id) {
            Some(mut entry) => entry.on_complete.take(),
            None => {
                tracing::debug!(id, "settlement for an entry no longer in the queue");
                None
            }
        }
    };
    if let Some(on_complete) = on_complete {
        on_complete(match outcome {
            SendOutcome::Ok => SendCompletion::Ok,
            SendOutcome::Error => SendCompletion::FailSending,
        });
    }
}

/// Terminal path for a dispatch refusal: retry while the budget lasts,
/// otherwise fail the entry.
fn fail_dispatch(inner: &Rc<RefCell<QueueInner>>, id: u64) {
    let on_complete = {
        let mut inner = inner.borrow_mut();
        let Some(mut entry) = inner.remove_in_progress(id) else {
            return;
        };
        if entry.retries < inner.options.max_retry_count {
            entry.retries += 1;
            inner.pending.push_front(entry);
            None
        } else {
            entry.on_complete.take()
        }
    };
    if let Some(on_complete) = on_complete {
        on_complete(SendCompletion::FailSending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_callback(
        log: &Rc<RefCell<Vec<SendCompletion>>>,
    ) -> SendCompleteCallback {
        let log = Rc::clone(log);
        Box::new(move |completion| log.borrow_mut().push(completion))
    }

    fn message(tag: &'static str) -> AmqpMessage {
        let mut message = AmqpMessage::new();
        message.set_correlation_id(tag);
        message
    }

    #[test]
    fn test_new_queue_is_empty() {
        let queue = SendQueue::new(QueueOptions::default());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_add_makes_queue_busy() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);
        assert!(!queue.is_empty());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_dispatch_preserves_submission_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);
        queue.add(message("b"), recording_callback(&log), Duration::ZERO);

        let mut seen = Vec::new();
        let mut settles: Vec<SettleCallback> = Vec::new();
        let mut dispatch = |m: AmqpMessage, settle: SettleCallback| {
            seen.push(m.correlation_id().map(str::to_owned));
            settles.push(settle);
            Ok(())
        };
        queue.do_work(Duration::ZERO, Some(&mut dispatch));

        assert_eq!(seen, vec![Some("a".into()), Some("b".into())]);
        assert!(!queue.is_empty());

        for settle in settles {
            settle(SendOutcome::Ok);
        }
        assert!(queue.is_empty());
        assert_eq!(
            *log.borrow(),
            vec![SendCompletion::Ok, SendCompletion::Ok]
        );
    }

    #[test]
    fn test_dispatch_failure_fails_entry_with_zero_retries() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);

        let mut dispatch = |_: AmqpMessage, _: SettleCallback| {
            Err(AmqpError::SendRefused("link detached".into()))
        };
        queue.do_work(Duration::ZERO, Some(&mut dispatch));

        assert!(queue.is_empty());
        assert_eq!(*log.borrow(), vec![SendCompletion::FailSending]);
    }

    #[test]
    fn test_dispatch_failure_requeues_within_retry_budget() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions {
            max_retry_count: 1,
            ..QueueOptions::default()
        });
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);

        let mut attempts = 0u32;
        let mut dispatch = |_: AmqpMessage, _: SettleCallback| {
            attempts += 1;
            Err(AmqpError::SendRefused("link detached".into()))
        };
        // First tick dispatches, fails, requeues, then re-dispatches the
        // requeued entry in the same drain loop and exhausts the budget.
        queue.do_work(Duration::ZERO, Some(&mut dispatch));

        assert_eq!(attempts, 2);
        assert!(queue.is_empty());
        assert_eq!(*log.borrow(), vec![SendCompletion::FailSending]);
    }

    #[test]
    fn test_timeout_sweep_fails_old_entries() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);

        queue.do_work(Duration::from_secs(600), None);
        assert!(!queue.is_empty());
        assert!(log.borrow().is_empty());

        queue.do_work(Duration::from_secs(601), None);
        assert!(queue.is_empty());
        assert_eq!(*log.borrow(), vec![SendCompletion::TimedOut]);
    }

    #[test]
    fn test_timeout_applies_to_in_progress_entries() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);

        let mut settles: Vec<SettleCallback> = Vec::new();
        let mut dispatch = |_: AmqpMessage, settle: SettleCallback| {
            settles.push(settle);
            Ok(())
        };
        queue.do_work(Duration::ZERO, Some(&mut dispatch));

        queue.do_work(Duration::from_secs(601), None);
        assert_eq!(*log.borrow(), vec![SendCompletion::TimedOut]);
        assert!(queue.is_empty());

        // Late settlement finds nothing to complete.
        for settle in settles {
            settle(SendOutcome::Ok);
        }
        assert_eq!(*log.borrow(), vec![SendCompletion::TimedOut]);
    }

    #[test]
    fn test_move_all_back_to_pending_preserves_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);
        queue.add(message("b"), recording_callback(&log), Duration::ZERO);
        queue.add(message("c"), recording_callback(&log), Duration::ZERO);

        // Dispatch all three without settling, then requeue them.
        let mut dispatch = |_: AmqpMessage, settle: SettleCallback| {
            drop(settle);
            Ok(())
        };
        queue.do_work(Duration::ZERO, Some(&mut dispatch));
        queue.move_all_back_to_pending();

        let mut seen = Vec::new();
        let mut redispatch = |m: AmqpMessage, settle: SettleCallback| {
            seen.push(m.correlation_id().map(str::to_owned));
            settle(SendOutcome::Ok);
            Ok(())
        };
        queue.do_work(Duration::ZERO, Some(&mut redispatch));

        assert_eq!(
            seen,
            vec![Some("a".into()), Some("b".into()), Some("c".into())]
        );
        assert_eq!(
            *log.borrow(),
            vec![SendCompletion::Ok, SendCompletion::Ok, SendCompletion::Ok]
        );
    }

    #[test]
    fn test_cancel_all_fires_cancelled_for_everything() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.add(message("a"), recording_callback(&log), Duration::ZERO);
        queue.add(message("b"), recording_callback(&log), Duration::ZERO);

        let mut dispatch = |_: AmqpMessage, settle: SettleCallback| {
            drop(settle);
            Ok(())
        };
        queue.do_work(Duration::ZERO, Some(&mut dispatch));
        queue.add(message("c"), recording_callback(&log), Duration::ZERO);

        queue.cancel_all();
        assert!(queue.is_empty());
        assert_eq!(
            *log.borrow(),
            vec![
                SendCompletion::Cancelled,
                SendCompletion::Cancelled,
                SendCompletion::Cancelled
            ]
        );
    }

    #[test]
    fn test_options_roundtrip() {
        let mut queue = SendQueue::new(QueueOptions::default());
        queue.set_max_enqueued_time_secs(42);
        let options = queue.options();
        assert_eq!(options.max_message_enqueued_time_secs, 42);

        let mut other = SendQueue::new(QueueOptions::default());
        other.apply_options(options);
        assert_eq!(other.options(), options);
    }
}
