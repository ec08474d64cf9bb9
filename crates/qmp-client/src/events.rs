//! Asynchronous events and their fan-out to subscribers.
//!
//! The reader thread publishes every event exactly once, in wire order. Each
//! subscriber owns a bounded queue; when a queue is full the configured
//! [`EventOverflow`] policy discards an event for that subscriber only and
//! the loss is counted. Publishing never blocks on a slow subscriber.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use qmp_config::EventOverflow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Tracing target for event dispatch.
pub(crate) const EVENTS_TARGET: &str = "qmp_client::events";

/// Time at which the monitor emitted an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Sub-second part in microseconds.
    pub microseconds: i64,
}

/// Well-known event names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `SHUTDOWN`
    Shutdown,
    /// `POWERDOWN`
    Powerdown,
    /// `RESET`
    Reset,
    /// `STOP`
    Stop,
    /// `RESUME`
    Resume,
    /// `SUSPEND`
    Suspend,
    /// `WAKEUP`
    Wakeup,
    /// `GUEST_PANICKED`
    GuestPanicked,
    /// `WATCHDOG`
    Watchdog,
    /// Any other event name.
    Other(String),
}

impl EventKind {
    /// Maps a wire event name onto a kind.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "SHUTDOWN" => Self::Shutdown,
            "POWERDOWN" => Self::Powerdown,
            "RESET" => Self::Reset,
            "STOP" => Self::Stop,
            "RESUME" => Self::Resume,
            "SUSPEND" => Self::Suspend,
            "WAKEUP" => Self::Wakeup,
            "GUEST_PANICKED" => Self::GuestPanicked,
            "WATCHDOG" => Self::Watchdog,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Asynchronous notification from the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEvent")]
pub struct Event {
    /// Event name as sent on the wire.
    #[serde(rename = "event")]
    pub name: String,
    /// Classified event name.
    #[serde(skip)]
    pub kind: EventKind,
    /// Event payload; `null` when absent.
    pub data: Value,
    /// Emission time.
    pub timestamp: Timestamp,
}

#[derive(Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Timestamp,
}

impl From<RawEvent> for Event {
    fn from(raw: RawEvent) -> Self {
        Self {
            kind: EventKind::from_name(&raw.event),
            name: raw.event,
            data: raw.data,
            timestamp: raw.timestamp,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out hub owned by a connection.
#[derive(Debug)]
pub(crate) struct EventDispatcher {
    shared: Arc<DispatcherShared>,
}

#[derive(Debug)]
struct DispatcherShared {
    capacity: usize,
    overflow: EventOverflow,
    replay_limit: usize,
    state: Mutex<DispatcherState>,
}

#[derive(Debug, Default)]
struct DispatcherState {
    next_id: u64,
    subscribers: BTreeMap<u64, Arc<SubscriberQueue>>,
    recent: VecDeque<Event>,
    closed: bool,
}

#[derive(Debug, Default)]
struct SubscriberQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

impl EventDispatcher {
    /// Creates a dispatcher. A zero capacity is treated as one.
    pub(crate) fn new(capacity: usize, overflow: EventOverflow, replay_limit: usize) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                capacity: capacity.max(1),
                overflow,
                replay_limit,
                state: Mutex::new(DispatcherState::default()),
            }),
        }
    }

    /// Registers a subscriber. Returns `None` once the dispatcher is closed.
    pub(crate) fn subscribe(&self) -> Option<Subscription> {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;

        let queue = Arc::new(SubscriberQueue::default());
        {
            let mut pending = lock(&queue.state);
            let skip = state.recent.len().saturating_sub(self.shared.capacity);
            pending.events.extend(state.recent.iter().skip(skip).cloned());
        }
        state.subscribers.insert(id, Arc::clone(&queue));
        debug!(
            target: EVENTS_TARGET,
            subscriber = id,
            replayed = state.recent.len().min(self.shared.capacity),
            "subscriber registered"
        );

        Some(Subscription {
            id,
            queue,
            dispatcher: Arc::downgrade(&self.shared),
        })
    }

    /// Delivers `event` to every current subscriber.
    pub(crate) fn publish(&self, event: Event) {
        let targets: Vec<(u64, Arc<SubscriberQueue>)> = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            if self.shared.replay_limit > 0 {
                if state.recent.len() == self.shared.replay_limit {
                    state.recent.pop_front();
                }
                state.recent.push_back(event.clone());
            }
            state
                .subscribers
                .iter()
                .map(|(id, queue)| (*id, Arc::clone(queue)))
                .collect()
        };

        for (id, queue) in targets {
            queue.push(id, event.clone(), self.shared.capacity, self.shared.overflow);
        }
    }

    /// Stops delivery. Queued events stay readable; new subscriptions fail.
    pub(crate) fn close(&self) {
        let subscribers = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            state.recent.clear();
            std::mem::take(&mut state.subscribers)
        };
        for queue in subscribers.values() {
            queue.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.shared.state).subscribers.len()
    }
}

impl DispatcherShared {
    fn remove(&self, id: u64) {
        let removed = lock(&self.state).subscribers.remove(&id);
        if let Some(queue) = removed {
            queue.close();
            debug!(target: EVENTS_TARGET, subscriber = id, "subscriber removed");
        }
    }
}

impl SubscriberQueue {
    fn push(&self, id: u64, event: Event, capacity: usize, overflow: EventOverflow) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        if state.events.len() >= capacity {
            state.dropped += 1;
            warn!(
                target: EVENTS_TARGET,
                subscriber = id,
                event = %event.name,
                policy = %overflow,
                dropped = state.dropped,
                "subscriber queue full; discarding event"
            );
            match overflow {
                EventOverflow::DropOldest => {
                    state.events.pop_front();
                }
                EventOverflow::DropNewest => return,
            }
        }
        state.events.push_back(event);
        drop(state);
        self.available.notify_one();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }
}

/// Receiving end of an event subscription.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    dispatcher: Weak<DispatcherShared>,
}

impl Subscription {
    /// Identifier of the subscription, unique per connection.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until an event arrives. Returns `None` once the subscription
    /// is closed and drained.
    #[must_use]
    pub fn recv(&self) -> Option<Event> {
        let mut state = lock(&self.queue.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            state = self
                .queue
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits up to `timeout` for an event.
    ///
    /// # Errors
    ///
    /// Returns [`RecvTimeoutError::Timeout`] when nothing arrived in time and
    /// [`RecvTimeoutError::Disconnected`] once the subscription is closed
    /// and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.queue.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RecvTimeoutError::Timeout);
            }
            state = self
                .queue
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Takes a queued event without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Event> {
        lock(&self.queue.state).events.pop_front()
    }

    /// Number of events discarded for this subscriber by the overflow policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        lock(&self.queue.state).dropped
    }

    /// Whether delivery has stopped. Queued events may still be read.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.queue.state).closed
    }

    /// Blocking iterator over events until the subscription closes.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        std::iter::from_fn(|| self.recv())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(self.id);
        }
    }
}
