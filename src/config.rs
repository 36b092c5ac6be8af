//! Tunables for the tailing pipeline.

use std::time::Duration;

/// Default capacity of each subscriber's slot.
pub const DEFAULT_SLOT_CAPACITY: usize = 1024;

/// Default capacity of the shared ingest queue feeding the broadcaster.
pub const DEFAULT_INGEST_CAPACITY: usize = 1024;

/// Default interval at which idle readers re-check their file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What the broadcaster does when a subscriber's slot is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DeliveryPolicy {
    /// Wait for the slot to free up. Nothing is lost, but a wedged subscriber
    /// eventually stalls ingestion from every file.
    #[default]
    Block,
    /// Drop the line for that slot only and count it in the slot's drop
    /// counter.
    DropNewest,
}

/// Configuration for a [`Pipeline`](crate::Pipeline) and its parts.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bounded capacity of every subscription slot.
    pub slot_capacity: usize,

    /// Bounded capacity of the queue between readers and the broadcaster.
    pub ingest_capacity: usize,

    /// Fallback re-check interval for readers when no filesystem event fires.
    pub poll_interval: Duration,

    /// Policy applied to slots registered without an explicit one.
    pub delivery_policy: DeliveryPolicy,

    /// Optional cap on registered subscriptions (`None` = unlimited).
    pub max_subscribers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            ingest_capacity: DEFAULT_INGEST_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            delivery_policy: DeliveryPolicy::Block,
            max_subscribers: None,
        }
    }
}

impl Config {
    pub fn with_slot_capacity(mut self, capacity: usize) -> Self {
        self.slot_capacity = capacity.max(1);
        self
    }

    pub fn with_ingest_capacity(mut self, capacity: usize) -> Self {
        self.ingest_capacity = capacity.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery_policy = policy;
        self
    }

    pub fn with_max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = Some(max);
        self
    }
}
