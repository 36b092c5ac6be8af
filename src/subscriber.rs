//! Drains one subscription into one connector.

use crate::connector::Connector;
use crate::publisher::{Subscription, SubscriptionId};

/// Outcome of a finished [`Subscriber`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriberReport {
    /// Lines the connector accepted.
    pub delivered: u64,
    /// Lines the connector rejected.
    pub failed: u64,
    /// Lines the publisher dropped for this slot before they arrived.
    pub dropped: u64,
    /// Error returned by the connector's `close`, if any.
    pub close_error: Option<String>,
}

/// Binds exactly one [`Subscription`] to exactly one [`Connector`].
#[derive(Debug)]
pub struct Subscriber<C> {
    subscription: Subscription,
    connector: C,
}

impl<C> Subscriber<C>
where
    C: Connector,
{
    pub fn new(subscription: Subscription, connector: C) -> Self {
        Subscriber {
            subscription,
            connector,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub fn name(&self) -> &str {
        self.subscription.name()
    }

    /// Delivers every line of the subscription, in order, until the slot is
    /// closed and drained. Then closes the connector once.
    ///
    /// A failed delivery is logged and counted, and the loop moves on to the
    /// next line.
    pub async fn run(self) -> SubscriberReport {
        let Subscriber {
            mut subscription,
            mut connector,
        } = self;
        let id = subscription.id();
        let mut report = SubscriberReport::default();

        while let Some(line) = subscription.recv().await {
            match connector.send(&line).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscriber = %id,
                        name = %subscription.name(),
                        path = %line.source().display(),
                        error = %e,
                        "failed to deliver line"
                    );
                }
            }
        }

        if let Err(e) = connector.close().await {
            tracing::warn!(
                subscriber = %id,
                name = %subscription.name(),
                error = %e,
                "failed to close connector"
            );
            report.close_error = Some(e.to_string());
        }
        report.dropped = subscription.dropped();

        tracing::debug!(
            subscriber = %id,
            name = %subscription.name(),
            delivered = report.delivered,
            failed = report.failed,
            dropped = report.dropped,
            "subscriber finished"
        );

        report
    }
}
