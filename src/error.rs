//! Error types shared across the tailing pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while starting a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Tail(#[from] TailError),
    #[error("Pipeline already started")]
    AlreadyStarted,
}

/// Errors raised while registering or managing tailed files.
#[derive(Debug, Error)]
pub enum TailError {
    #[error("Failed to open {}: {}", path.display(), source)]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("Tail manager has been stopped")]
    Stopped,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by the directory watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to add path to watch: {}", .0.display())]
    AddFailure(PathBuf),
    #[error("Error receiving event: {0}")]
    Event(#[from] io::Error),
}

/// Errors raised by the broadcast hub.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Publisher is closed")]
    Closed,
    #[error("Subscriber limit of {0} reached")]
    TooManySubscribers(usize),
}

/// Errors raised by a [`Connector`](crate::Connector) implementation.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Connector I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Connector is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Reasons the new-file discovery loop can end abnormally.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Directory watcher closed unexpectedly")]
    WatcherClosed,
}
