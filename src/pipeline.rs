//! Wires the watcher, tail manager, publisher and subscribers together.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DeliveryPolicy};
use crate::connector::Connector;
use crate::discovery::{DiscoveryLoop, DiscoveryState};
use crate::error::{DiscoveryError, Error, PublishError};
use crate::events::DirEvents;
use crate::publisher::{MetricsSnapshot, Publisher, SubscriptionId};
use crate::subscriber::{Subscriber, SubscriberReport};
use crate::tail::{TailManager, TrackedFile};

struct SubscriberTask {
    id: SubscriptionId,
    name: String,
    handle: JoinHandle<SubscriberReport>,
}

/// What a finished [`Pipeline`] left behind.
#[derive(Debug)]
pub struct ShutdownReport {
    /// How the discovery loop ended, if it was ever started.
    pub discovery: Option<Result<(), DiscoveryError>>,
    /// One report per subscriber, in registration order.
    pub subscribers: Vec<(String, SubscriberReport)>,
    /// Final publisher counters.
    pub metrics: MetricsSnapshot,
}

/// Tails every file in a directory and fans the lines out to subscribers.
///
/// Must be created from within a Tokio runtime.
///
/// ```no_run
/// use dirtail::{Config, Pipeline, WriterConnector};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut pipeline = Pipeline::new("/var/log/app", Config::default());
/// pipeline.subscribe("stdout", WriterConnector::stdout().with_source())?;
/// pipeline.start().await?;
///
/// let report = pipeline.run_until(tokio::signal::ctrl_c()).await;
/// println!("{:?}", report.subscribers);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    directory: PathBuf,
    publisher: Publisher,
    manager: Arc<TailManager>,
    shutdown: CancellationToken,
    broadcaster: JoinHandle<()>,
    discovery: Option<JoinHandle<Result<(), DiscoveryError>>>,
    discovery_state: Option<watch::Receiver<DiscoveryState>>,
    subscribers: Vec<SubscriberTask>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("directory", &self.directory)
            .field("manager", &self.manager)
            .field("subscribers", &self.subscribers.len())
            .field("started", &self.discovery.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn new(directory: impl Into<PathBuf>, config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let (publisher, broadcaster) = Publisher::new(&config);
        let manager = TailManager::with_cancellation(publisher.clone(), &config, shutdown.clone());

        Pipeline {
            directory: directory.into(),
            publisher,
            manager: Arc::new(manager),
            shutdown,
            broadcaster: tokio::spawn(broadcaster.run()),
            discovery: None,
            discovery_state: None,
            subscribers: Vec::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn manager(&self) -> &TailManager {
        &self.manager
    }

    /// Token whose cancellation stops discovery and every reader. Hand it to
    /// whatever delivers the process stop signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// State of the discovery loop, once started.
    pub fn discovery_state(&self) -> Option<DiscoveryState> {
        self.discovery_state.as_ref().map(|state| *state.borrow())
    }

    /// Registers a subscriber using the configured delivery policy and spawns
    /// its delivery loop.
    pub fn subscribe<C>(
        &mut self,
        name: impl Into<String>,
        connector: C,
    ) -> Result<SubscriptionId, PublishError>
    where
        C: Connector + 'static,
    {
        let subscription = self.publisher.subscribe(name)?;
        Ok(self.spawn_subscriber(Subscriber::new(subscription, connector)))
    }

    /// Like [`subscribe`](Self::subscribe), with an explicit delivery policy.
    pub fn subscribe_with<C>(
        &mut self,
        name: impl Into<String>,
        policy: DeliveryPolicy,
        connector: C,
    ) -> Result<SubscriptionId, PublishError>
    where
        C: Connector + 'static,
    {
        let subscription = self.publisher.subscribe_with(name, policy)?;
        Ok(self.spawn_subscriber(Subscriber::new(subscription, connector)))
    }

    fn spawn_subscriber<C>(&mut self, subscriber: Subscriber<C>) -> SubscriptionId
    where
        C: Connector + 'static,
    {
        let id = subscriber.id();
        let name = subscriber.name().to_string();

        self.subscribers.push(SubscriberTask {
            id,
            name,
            handle: tokio::spawn(subscriber.run()),
        });
        id
    }

    /// Removes a subscriber. It still delivers what was already queued.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }

    /// Starts watching the directory, tails every file already in it from
    /// its end, then follows newly created files from their first byte.
    ///
    /// The watch is registered before the scan so that no file created in
    /// between is missed.
    pub async fn start(&mut self) -> Result<Vec<TrackedFile>, Error> {
        if self.discovery.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let events = DirEvents::watch(&self.directory)?;
        let files = self.manager.discover(events.directory()).await?;

        let discovery = DiscoveryLoop::new(events, Arc::clone(&self.manager), self.shutdown.clone());
        self.discovery_state = Some(discovery.state());
        self.discovery = Some(tokio::spawn(discovery.run()));

        Ok(files)
    }

    /// Waits for `signal`, then shuts down.
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future,
    {
        tokio::select! {
            _ = signal => {}
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown().await
    }

    /// Stops discovery and every reader, then lets the publisher and each
    /// subscriber drain whatever is already queued before returning.
    pub async fn shutdown(self) -> ShutdownReport {
        let Pipeline {
            publisher,
            manager,
            shutdown,
            broadcaster,
            discovery,
            subscribers,
            ..
        } = self;

        tracing::info!("shutting down");
        shutdown.cancel();
        manager.stop_all();
        manager.join().await;

        let discovery = match discovery {
            Some(handle) => match handle.await {
                Ok(res) => Some(res),
                Err(e) => {
                    tracing::error!(error = %e, "discovery task failed");
                    None
                }
            },
            None => None,
        };

        let metrics = publisher.metrics_handle();
        // The ingest queue closes once the last handle is gone.
        drop(manager);
        drop(publisher);
        if let Err(e) = broadcaster.await {
            tracing::error!(error = %e, "broadcaster task failed");
        }
        let metrics = metrics.snapshot();

        let mut reports = Vec::with_capacity(subscribers.len());
        for task in subscribers {
            match task.handle.await {
                Ok(report) => reports.push((task.name, report)),
                Err(e) => {
                    tracing::error!(subscriber = %task.id, error = %e, "subscriber task failed")
                }
            }
        }

        tracing::info!(
            lines = metrics.lines_broadcast,
            subscribers = reports.len(),
            "shutdown complete"
        );

        ShutdownReport {
            discovery,
            subscribers: reports,
            metrics,
        }
    }
}
