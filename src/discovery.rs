//! The loop that turns directory events into newly tailed files.

use std::fmt;
use std::sync::Arc;

use futures_util::stream::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{DiscoveryError, TailError, WatchError};
use crate::events::DirEvent;
use crate::tail::TailManager;

/// Lifecycle of a [`DiscoveryLoop`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscoveryState {
    Watching,
    Stopped,
}

/// Consumes directory events and calls [`TailManager::track_new`] for every
/// created file.
///
/// Stopping the loop does not stop readers it already started; that is
/// [`TailManager::stop_all`]'s job.
pub struct DiscoveryLoop<S> {
    events: S,
    manager: Arc<TailManager>,
    token: CancellationToken,
    state: watch::Sender<DiscoveryState>,
}

impl<S> fmt::Debug for DiscoveryLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryLoop")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<S> DiscoveryLoop<S>
where
    S: Stream<Item = Result<DirEvent, WatchError>> + Unpin,
{
    pub fn new(events: S, manager: Arc<TailManager>, token: CancellationToken) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Watching);

        DiscoveryLoop {
            events,
            manager,
            token,
            state,
        }
    }

    /// Observes the loop's state.
    pub fn state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    /// Runs until the token is cancelled (`Ok`) or the event stream ends
    /// (`Err(DiscoveryError::WatcherClosed)`).
    pub async fn run(mut self) -> Result<(), DiscoveryError> {
        let result = loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => break Ok(()),
                event = self.events.next() => event,
            };

            match event {
                Some(Ok(DirEvent::Created(path))) => match self.manager.track_new(&path).await {
                    Ok(Some(_)) | Ok(None) => {}
                    Err(TailError::Stopped) => {
                        tracing::debug!(path = %path.display(), "readers stopped, ignoring new file");
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to tail new file"),
                },
                Some(Ok(DirEvent::Other)) => {}
                Some(Err(e)) => tracing::debug!(error = %e, "skipping bad watch event"),
                None => {
                    tracing::error!("directory watcher closed, no longer discovering files");
                    break Err(DiscoveryError::WatcherClosed);
                }
            }
        };

        self.state.send_replace(DiscoveryState::Stopped);
        result
    }
}
