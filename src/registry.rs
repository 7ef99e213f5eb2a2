//! Per-job subscriber fan-out.
//!
//! Every subscription owns a bounded buffer. Publishing never waits on a
//! consumer: when a buffer is full the oldest undelivered event is dropped and
//! a `channel_overrun` diagnostic is logged.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::api::JobEvent;
use crate::state_machine::JobId;

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<JobEvent>,
    closed: bool,
    dropped: u64,
}

/// Bounded buffer for one subscription.
///
/// Drop-oldest has to be decided by the publisher when it finds the buffer full;
/// a `tokio::sync::mpsc` sender can only wait or fail there, and cannot evict
/// what the receiver has not read yet.
#[derive(Debug)]
struct Channel {
    state: Mutex<ChannelState>,
    notify: Notify,
    capacity: usize,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffer an event. Returns true if an older event had to be dropped.
    fn push(&self, event: JobEvent) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        let mut overrun = false;
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            state.dropped += 1;
            overrun = true;
        }
        state.queue.push_back(event);
        drop(state);
        self.notify.notify_one();
        overrun
    }

    fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }
}

/// Identifies one registration. Copies are cheap; unsubscribing twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    job_id: JobId,
}

impl SubscriptionHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Receiving side of a subscription.
#[derive(Debug)]
pub struct EventStream {
    channel: Arc<Channel>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the subscription is closed
    /// and every buffered event has been read.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            let notified = self.channel.notify.notified();
            {
                let mut state = self.channel.state();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking read of the next buffered event.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.channel.state().queue.pop_front()
    }

    /// Number of events lost to buffer overruns on this subscription.
    pub fn dropped(&self) -> u64 {
        self.channel.state().dropped
    }

    /// True once the subscription is closed, even if events remain buffered.
    pub fn is_closed(&self) -> bool {
        self.channel.state().closed
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: EventStream,
    /// False when the job was already terminal and the subscription was served
    /// its final status without being registered.
    pub registered: bool,
}

/// Outcome of one `publish` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub overruns: usize,
    pub disconnected: usize,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    channel: Arc<Channel>,
}

#[derive(Debug)]
pub struct SubscriberRegistry {
    /// job -> its registered channels
    jobs: DashMap<JobId, Vec<Subscriber>>,
    /// subscription id -> job, for unsubscribing by handle
    handles: DashMap<u64, JobId>,
    buffer_size: usize,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            handles: DashMap::new(),
            buffer_size,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a channel for `job_id`.
    ///
    /// `current` is the job's latest event. If it is terminal the subscriber gets
    /// it once and nothing is registered.
    pub fn subscribe(&self, job_id: JobId, current: &JobEvent) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle { id, job_id };
        let channel = Arc::new(Channel::new(self.buffer_size));

        if current.is_terminal() {
            channel.push(current.clone());
            channel.close();
            debug!(%job_id, status = %current.status, "job already terminal, subscription not registered");
            return Subscription {
                handle,
                events: EventStream { channel },
                registered: false,
            };
        }

        self.jobs.entry(job_id).or_default().push(Subscriber {
            id,
            channel: Arc::clone(&channel),
        });
        self.handles.insert(id, job_id);
        debug!(%job_id, subscription = id, "subscriber registered");

        Subscription {
            handle,
            events: EventStream { channel },
            registered: true,
        }
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some((_, job_id)) = self.handles.remove(&handle.id) else {
            return false;
        };
        if let Some(mut subscribers) = self.jobs.get_mut(&job_id) {
            if let Some(pos) = subscribers.iter().position(|s| s.id == handle.id) {
                let subscriber = subscribers.swap_remove(pos);
                subscriber.channel.close();
            }
        }
        self.jobs.remove_if(&job_id, |_, subscribers| subscribers.is_empty());
        debug!(%job_id, subscription = handle.id, "subscriber removed");
        true
    }

    /// Deliver `event` to every channel registered for `job_id`.
    ///
    /// Channels whose stream was dropped are pruned. A terminal event closes and
    /// removes every remaining channel of the job after delivery.
    pub fn publish(&self, job_id: JobId, event: &JobEvent) -> PublishReport {
        let mut report = PublishReport::default();

        let Some(mut subscribers) = self.jobs.get_mut(&job_id) else {
            return report;
        };

        subscribers.retain(|subscriber| {
            // Only the registry still holds the channel: the consumer went away.
            if Arc::strong_count(&subscriber.channel) == 1 {
                self.handles.remove(&subscriber.id);
                report.disconnected += 1;
                return false;
            }
            if subscriber.channel.push(event.clone()) {
                report.overruns += 1;
                warn!(
                    %job_id,
                    subscription = subscriber.id,
                    status = %event.status,
                    "channel_overrun: dropped oldest undelivered event"
                );
            }
            report.delivered += 1;
            true
        });
        drop(subscribers);

        if event.is_terminal() {
            if let Some((_, subscribers)) = self.jobs.remove(&job_id) {
                for subscriber in subscribers {
                    self.handles.remove(&subscriber.id);
                    subscriber.channel.close();
                }
            }
            debug!(%job_id, status = %event.status, "terminal event delivered, subscribers released");
        } else {
            self.jobs.remove_if(&job_id, |_, subscribers| subscribers.is_empty());
        }

        report
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.jobs.get(&job_id).map_or(0, |subscribers| subscribers.len())
    }

    pub fn active_subscriptions(&self) -> usize {
        self.handles.len()
    }
}
