//! Asynchronous directory tailing with fan-out of appended lines to pluggable
//! connectors.
//!
//! Every file already present in a directory is followed from its current
//! end, and every file created afterwards is followed from its first byte.
//! Each appended line is broadcast to all registered subscribers, which hand
//! it to their own [`Connector`].
//!
//! ## Example
//!
//! ```no_run
//! use dirtail::{Config, NoopConnector, Pipeline, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut pipeline = Pipeline::new("/var/log/app", Config::default());
//!
//!     // Register subscribers before starting so that they see every line.
//!     pipeline.subscribe("collector", TcpConnector::connect("127.0.0.1:5170").await?)?;
//!     pipeline.subscribe("sink", NoopConnector)?;
//!
//!     for file in pipeline.start().await? {
//!         println!("tailing {}", file.path().display());
//!     }
//!
//!     let token = pipeline.shutdown_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         token.cancel();
//!     });
//!
//!     let report = pipeline.run_until(std::future::pending::<()>()).await;
//!     for (name, stats) in report.subscribers {
//!         println!("{}: {} delivered, {} failed", name, stats.delivered, stats.failed);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery
//!
//! Each subscriber has a bounded slot. With the default
//! [`DeliveryPolicy::Block`] nothing is lost, but a subscriber that stops
//! reading eventually stalls ingestion from every file.
//! [`DeliveryPolicy::DropNewest`] trades that for per-slot drop counting.
//!
//! ## Caveats
//!
//! A file that existed before [`Pipeline::start`] only yields lines appended
//! after its scan. A file that is removed stops being tailed; if it is
//! recreated, the new file is picked up from its first byte.

mod config;
mod connector;
mod discovery;
mod error;
mod events;
mod pipeline;
mod publisher;
mod reader;
mod subscriber;
mod tail;
mod wake;

pub use config::{Config, DeliveryPolicy};
pub use connector::{ChannelConnector, Connector, NoopConnector, TcpConnector, WriterConnector};
pub use discovery::{DiscoveryLoop, DiscoveryState};
pub use error::{ConnectorError, DiscoveryError, Error, PublishError, TailError, WatchError};
pub use events::{DirEvent, DirEvents};
pub use pipeline::{Pipeline, ShutdownReport};
pub use publisher::{
    Broadcaster, MetricsHandle, MetricsSnapshot, Publisher, Subscription, SubscriptionId,
};
pub use reader::{Line, LineReader, StartAt};
pub use subscriber::{Subscriber, SubscriberReport};
pub use tail::{Origin, TailManager, TrackedFile};
