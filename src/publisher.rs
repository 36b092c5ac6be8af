//! Broadcast hub fanning every tailed line out to registered subscriptions.
//!
//! ```text
//! [Readers]                    [Broadcaster]                [Slots]
//!  a.log ──┐                                             ┌──→ Subscription 0
//!  b.log ──┼──→ ingest queue ──→ registry snapshot ──→ Arc<Line> ──→ Subscription 1
//!  c.log ──┘                                             └──→ Subscription 2
//! ```
//!
//! Readers hand lines to a [`Publisher`] handle. A single [`Broadcaster`] task
//! drains the ingest queue, so every subscription observes the same global
//! arrival order. Each slot is a bounded queue governed by its
//! [`DeliveryPolicy`].
//!
//! The registry sits behind a mutex that is never held across an `.await`.
//! Its slot list is an immutable `Arc<[Slot]>` that is swapped on every
//! registration change. The broadcaster takes that list once per line, so
//! subscribing and unsubscribing are safe at any time, including mid-stream.
//! A slot sees every line broadcast after its registration returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DeliveryPolicy};
use crate::error::PublishError;
use crate::reader::Line;

/// Drop warnings are logged on the first drop and then every this many.
const DROP_LOG_EVERY: u64 = 1000;

/// Identifier of a registered subscription.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// The receiving end of a registered slot.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    name: String,
    receiver: mpsc::Receiver<Arc<Line>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of lines dropped for this slot because it was full.
    ///
    /// Always zero under [`DeliveryPolicy::Block`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Receives the next line, or `None` once the slot is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Line>> {
        self.receiver.recv().await
    }
}

#[derive(Clone)]
struct Slot {
    id: SubscriptionId,
    name: String,
    policy: DeliveryPolicy,
    sender: mpsc::Sender<Arc<Line>>,
    dropped: Arc<AtomicU64>,
    /// Cancelled on unsubscribe, releasing a broadcaster parked on this slot.
    removed: CancellationToken,
}

struct Registry {
    slots: Arc<[Slot]>,
    next_id: u64,
}

impl Registry {
    fn new() -> Self {
        Registry {
            slots: Arc::from(Vec::new()),
            next_id: 0,
        }
    }

    /// Removes the slot with `id`, returning it if it was registered.
    fn remove(&mut self, id: SubscriptionId) -> Option<Slot> {
        let removed = self.slots.iter().find(|slot| slot.id == id).cloned()?;
        self.slots = self.slots.iter().filter(|slot| slot.id != id).cloned().collect();
        Some(removed)
    }
}

/// Counters for the broadcast hub.
#[derive(Debug, Default)]
struct PublisherMetrics {
    lines_received: AtomicU64,
    lines_broadcast: AtomicU64,
    lines_dropped: AtomicU64,
    slots_closed: AtomicU64,
}

/// Point-in-time copy of the broadcast hub's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    /// Lines taken off the ingest queue.
    pub lines_received: u64,
    /// Lines offered to every slot registered at the time.
    pub lines_broadcast: u64,
    /// Per-slot drops across all `DropNewest` slots.
    pub lines_dropped: u64,
    /// Slots removed because their receiver went away.
    pub slots_closed: u64,
}

impl PublisherMetrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            lines_broadcast: self.lines_broadcast.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
            slots_closed: self.slots_closed.load(Ordering::Relaxed),
        }
    }
}

/// Handle for reading publisher counters.
///
/// Stays valid after every [`Publisher`] has been dropped and the
/// [`Broadcaster`] has finished.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    metrics: Arc<PublisherMetrics>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // No registry operation can leave it half-updated.
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle used to register subscriptions and publish lines.
///
/// The hub has no explicit shutdown: once every `Publisher` clone is dropped,
/// the [`Broadcaster`] drains what is queued, closes every slot and returns.
#[derive(Clone)]
pub struct Publisher {
    ingest: mpsc::Sender<Line>,
    registry: Arc<Mutex<Registry>>,
    metrics: Arc<PublisherMetrics>,
    slot_capacity: usize,
    default_policy: DeliveryPolicy,
    max_subscribers: Option<usize>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.subscriber_count())
            .field("slot_capacity", &self.slot_capacity)
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

impl Publisher {
    /// Creates the hub. The returned [`Broadcaster`] must be run (typically
    /// spawned as a task) for lines to flow.
    pub fn new(config: &Config) -> (Publisher, Broadcaster) {
        let (tx, rx) = mpsc::channel(config.ingest_capacity.max(1));
        let registry = Arc::new(Mutex::new(Registry::new()));
        let metrics = Arc::new(PublisherMetrics::default());

        let publisher = Publisher {
            ingest: tx,
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
            slot_capacity: config.slot_capacity.max(1),
            default_policy: config.delivery_policy,
            max_subscribers: config.max_subscribers,
        };
        let broadcaster = Broadcaster {
            ingest: rx,
            registry,
            metrics,
        };

        (publisher, broadcaster)
    }

    /// Registers a slot using the configured default delivery policy.
    pub fn subscribe(&self, name: impl Into<String>) -> Result<Subscription, PublishError> {
        self.subscribe_with(name, self.default_policy)
    }

    /// Registers a slot with an explicit delivery policy.
    ///
    /// Fails with [`PublishError::TooManySubscribers`] if a limit is
    /// configured and reached, and with [`PublishError::Closed`] once the
    /// broadcaster has finished.
    pub fn subscribe_with(
        &self,
        name: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> Result<Subscription, PublishError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.slot_capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        if self.ingest.is_closed() {
            return Err(PublishError::Closed);
        }

        let mut registry = lock(&self.registry);
        if let Some(max) = self.max_subscribers {
            if registry.slots.len() >= max {
                return Err(PublishError::TooManySubscribers(max));
            }
        }

        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        let mut slots = registry.slots.to_vec();
        slots.push(Slot {
            id,
            name: name.clone(),
            policy,
            sender: tx,
            dropped: Arc::clone(&dropped),
            removed: CancellationToken::new(),
        });
        registry.slots = slots.into();
        drop(registry);

        tracing::debug!(subscriber = %id, name = %name, ?policy, "subscription registered");

        Ok(Subscription {
            id,
            name,
            receiver: rx,
            dropped,
        })
    }

    /// Removes a slot. Its subscription still yields what was already queued.
    ///
    /// If the broadcaster is blocked waiting for room in this slot, it gives
    /// up on that line for this slot and moves on.
    ///
    /// Returns `false` if no such slot is registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = lock(&self.registry).remove(id);

        match removed {
            Some(slot) => {
                slot.removed.cancel();
                tracing::debug!(subscriber = %id, "subscription removed");
                true
            }
            None => false,
        }
    }

    /// Number of currently registered slots.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).slots.len()
    }

    /// Queues a line for broadcast, waiting if the ingest queue is full.
    pub async fn publish(&self, line: Line) -> Result<(), PublishError> {
        self.ingest
            .send(line)
            .await
            .map_err(|_| PublishError::Closed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns a handle that does not keep the publisher open.
    pub fn metrics_handle(&self) -> MetricsHandle {
        MetricsHandle {
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// The task side of the hub. See [`Publisher::new`].
pub struct Broadcaster {
    ingest: mpsc::Receiver<Line>,
    registry: Arc<Mutex<Registry>>,
    metrics: Arc<PublisherMetrics>,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster").finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Fans lines out until every [`Publisher`] handle has been dropped, then
    /// closes all slots so their subscribers can drain and exit.
    pub async fn run(mut self) {
        while let Some(line) = self.ingest.recv().await {
            self.broadcast(Arc::new(line)).await;
        }

        let slots = std::mem::replace(&mut lock(&self.registry).slots, Arc::from(Vec::new()));

        tracing::debug!(slots = slots.len(), "publisher closed, releasing subscriptions");
    }

    async fn broadcast(&self, line: Arc<Line>) {
        self.metrics.lines_received.fetch_add(1, Ordering::Relaxed);

        let slots = Arc::clone(&lock(&self.registry).slots);

        for slot in slots.iter() {
            match slot.policy {
                DeliveryPolicy::Block => {
                    tokio::select! {
                        res = slot.sender.send(Arc::clone(&line)) => {
                            if res.is_err() {
                                self.close_slot(slot);
                            }
                        }
                        _ = slot.removed.cancelled() => {}
                    }
                }
                DeliveryPolicy::DropNewest => match slot.sender.try_send(Arc::clone(&line)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => self.record_drop(slot),
                    Err(TrySendError::Closed(_)) => self.close_slot(slot),
                },
            }
        }

        self.metrics.lines_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self, slot: &Slot) {
        let previous = slot.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.lines_dropped.fetch_add(1, Ordering::Relaxed);

        if previous % DROP_LOG_EVERY == 0 {
            tracing::warn!(
                subscriber = %slot.id,
                name = %slot.name,
                dropped = previous + 1,
                "subscription full, dropping lines"
            );
        }
    }

    fn close_slot(&self, slot: &Slot) {
        let removed = lock(&self.registry).remove(slot.id);

        if removed.is_some() {
            self.metrics.slots_closed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                subscriber = %slot.id,
                name = %slot.name,
                "subscription receiver dropped, unregistering"
            );
        }
    }
}
