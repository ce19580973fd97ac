// Subscription state, mailbox accounting, and delivery.
//
// The reader task is the only mailbox producer. The consumer is either
// a dedicated delivery task (async subscriptions, one per subscription,
// callbacks serialized) or callers of `next_msg` (sync subscriptions).
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use crate::connection::ConnCore;
use crate::errors::{Error, Result};
use crate::message::Message;

/// Callback invoked for each message on an asynchronous subscription.
pub type MessageHandler = Box<dyn FnMut(Message) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainState {
    Active,
    Draining,
    Closed,
}

pub(crate) struct SubState {
    // Producer side of the mailbox; dropping it closes the mailbox.
    pub(crate) tx: Option<mpsc::Sender<Message>>,
    pub(crate) max: Option<u64>,
    pub(crate) slow: bool,
    pub(crate) drain: DrainState,
    // Error reported to consumers once the mailbox is exhausted.
    pub(crate) closed_err: Option<Error>,
}

pub(crate) struct SubInner {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue: String,
    // Non-owning back-pointer; the connection owns the registry.
    pub(crate) core: Weak<ConnCore>,
    pub(crate) is_async: bool,
    pub(crate) state: Mutex<SubState>,
    pub(crate) delivered: AtomicU64,
    pub(crate) enqueued: AtomicU64,
    pub(crate) bytes: AtomicU64,
    // Messages sitting in the mailbox or in a running callback.
    pub(crate) pending: AtomicUsize,
    pub(crate) drained: Notify,
    // Receiver parked here for sync subscriptions; the async mutex
    // serializes concurrent next_msg callers.
    pub(crate) receiver: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

pub(crate) enum EnqueueOutcome {
    Enqueued,
    Dropped,
    SlowConsumer,
}

impl SubInner {
    // Called by the reader task with the connection lock held
    // (connection before subscription, never the reverse).
    pub(crate) fn enqueue(&self, msg: Message) -> EnqueueOutcome {
        let len = msg.payload.len() as u64;
        let mut st = self.state.lock().unwrap();
        if st.drain == DrainState::Closed {
            return EnqueueOutcome::Dropped;
        }
        if let Some(max) = st.max {
            if self.enqueued.load(Ordering::SeqCst) >= max {
                return EnqueueOutcome::Dropped;
            }
        }
        let Some(tx) = &st.tx else {
            return EnqueueOutcome::Dropped;
        };
        match tx.try_send(msg) {
            Ok(()) => {
                st.slow = false;
                self.enqueued.fetch_add(1, Ordering::SeqCst);
                self.bytes.fetch_add(len, Ordering::SeqCst);
                self.pending.fetch_add(1, Ordering::SeqCst);
                EnqueueOutcome::Enqueued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                st.slow = true;
                EnqueueOutcome::SlowConsumer
            }
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Dropped,
        }
    }

    // Close the mailbox exactly once, recording the error consumers see
    // after the queued messages are exhausted.
    pub(crate) fn close_mailbox(&self, reason: Error) {
        let mut st = self.state.lock().unwrap();
        if st.drain == DrainState::Closed {
            return;
        }
        st.drain = DrainState::Closed;
        st.closed_err = Some(reason);
        st.tx = None;
        drop(st);
        self.drained.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().drain == DrainState::Closed
    }

    // Remaining auto-unsubscribe budget, read under the subscription
    // lock at the moment of reconnect replay.
    pub(crate) fn replay_budget(&self) -> (Option<u64>, bool) {
        let st = self.state.lock().unwrap();
        match st.max {
            Some(max) => {
                let remaining = max.saturating_sub(self.delivered.load(Ordering::SeqCst));
                (Some(remaining), remaining == 0)
            }
            None => (None, false),
        }
    }

    fn note_consumed(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

/// A registered interest in a subject. Handles are cheap to clone and
/// stay usable until unsubscribed, drained, or the connection closes.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.inner.subject)
            .field("queue_group", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// The subject pattern this subscription was created with.
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// The queue group name, empty when not part of a group.
    pub fn queue_group(&self) -> &str {
        &self.inner.queue
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.is_closed() && self.inner.core.strong_count() > 0
    }

    /// Messages handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// Messages currently queued in the mailbox or in a callback.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Pull the next message from a synchronous subscription.
    pub async fn next_msg(&self, timeout: Duration) -> Result<Message> {
        if self.inner.is_async {
            return Err(Error::TypeSubscription);
        }
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.slow {
                st.slow = false;
                return Err(Error::SlowConsumer);
            }
            if let Some(max) = st.max {
                if self.inner.delivered.load(Ordering::SeqCst) >= max {
                    return Err(Error::MaxMessages);
                }
            }
        }

        let mut guard = self.inner.receiver.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(self.close_reason());
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout),
            Ok(None) => Err(self.close_reason()),
            Ok(Some(msg)) => {
                self.inner.note_consumed();
                let delivered = self.inner.delivered.fetch_add(1, Ordering::SeqCst) + 1;
                let max = self.inner.state.lock().unwrap().max;
                if let Some(max) = max {
                    if delivered > max {
                        return Err(Error::MaxMessages);
                    }
                }
                Ok(msg)
            }
        }
    }

    /// Ask the broker to stop delivery after `max` more total messages
    /// and record the budget locally.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        let core = self.core()?;
        core.auto_unsubscribe(&self.inner, max)
    }

    /// Remove interest. The handle is invalid afterwards.
    pub fn unsubscribe(&self) -> Result<()> {
        let core = self.core()?;
        core.unsubscribe(&self.inner)
    }

    /// Gracefully unwind: revoke interest at the broker, then wait for
    /// every already-enqueued message to be consumed before closing.
    pub async fn drain(&self) -> Result<()> {
        let core = self.core()?;
        let was_active = {
            let mut st = self.inner.state.lock().unwrap();
            match st.drain {
                DrainState::Closed => return Err(Error::BadSubscription),
                DrainState::Draining => false,
                DrainState::Active => {
                    st.drain = DrainState::Draining;
                    true
                }
            }
        };
        let drain_timeout = core.drain_timeout();
        if was_active {
            core.send_unsub_proto(self.inner.sid)?;
            // Fence: once the barrier returns, the broker has processed
            // the UNSUB and no further deliveries are in flight.
            let _ = core.flush_barrier(drain_timeout).await;
        }

        let inner = &self.inner;
        let wait = async {
            loop {
                let notified = inner.drained.notified();
                if inner.pending.load(Ordering::SeqCst) == 0 || inner.is_closed() {
                    break;
                }
                notified.await;
            }
        };
        let timed_out = tokio::time::timeout(drain_timeout, wait).await.is_err();
        core.finalize_subscription(&self.inner);
        if timed_out {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    fn core(&self) -> Result<Arc<ConnCore>> {
        self.inner.core.upgrade().ok_or(Error::BadSubscription)
    }

    fn close_reason(&self) -> Error {
        self.inner
            .state
            .lock()
            .unwrap()
            .closed_err
            .clone()
            .unwrap_or(Error::ConnectionClosed)
    }
}

// Delivery task for asynchronous subscriptions. Pulls from the mailbox
// and invokes the callback; ordering is the mailbox order.
pub(crate) async fn run_delivery(
    sub: Arc<SubInner>,
    mut rx: mpsc::Receiver<Message>,
    mut handler: MessageHandler,
) {
    while let Some(msg) = rx.recv().await {
        let delivered = sub.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        let max = sub.state.lock().unwrap().max;
        let over_budget = max.is_some_and(|m| delivered > m);
        if !over_budget {
            handler(msg);
        }
        sub.note_consumed();
        if let Some(max) = max {
            if delivered >= max {
                // Budget exhausted; the broker already stopped sending.
                if let Some(core) = sub.core.upgrade() {
                    core.finalize_subscription(&sub);
                }
                break;
            }
        }
    }
}
