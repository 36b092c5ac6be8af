//! Everything related to watching a directory for newly created files.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;

use futures_util::ready;
use futures_util::stream::Stream as FuturesStream;
use tokio::sync::mpsc;

use crate::error::WatchError;

/// A filesystem event for the watched directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirEvent {
    /// A regular file was created at the given path.
    Created(PathBuf),
    /// Anything else (modification, removal, directories, ...).
    Other,
}

/// Watches a single directory, non-recursively, and can be polled to receive
/// [`DirEvent`]s.
///
/// Internally, `DirEvents` contains a [`notify::Watcher`] from where
/// filesystem events are proxied.
///
/// [`notify::Watcher`]: ../notify/trait.Watcher.html
pub struct DirEvents {
    inner: notify::RecommendedWatcher,
    directory: PathBuf,
    /// Events already split out of a multi-path notify event.
    pending: VecDeque<DirEvent>,
    event_stream: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl Debug for DirEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("DirEvents")
            .field("directory", &self.directory)
            .field("pending", &self.pending)
            .finish()
    }
}

impl DirEvents {
    /// Starts watching `directory`.
    pub fn watch(directory: impl AsRef<Path>) -> Result<Self, WatchError> {
        use notify::Watcher;

        let directory = absolutify(directory.as_ref())?;
        if !directory.is_dir() {
            return Err(WatchError::AddFailure(directory));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The only way `send` can fail is if the receiver is dropped,
            // which only happens when `DirEvents` itself is being dropped.
            let _ = tx.send(res);
        })
        .map_err(|e| WatchError::Event(into_io_error(e)))?;

        inner
            .watch(&directory, notify::RecursiveMode::NonRecursive)
            .map_err(|_e| WatchError::AddFailure(directory.clone()))?;

        Ok(DirEvents {
            inner,
            directory,
            pending: VecDeque::new(),
            event_stream: rx,
        })
    }

    /// Returns the canonicalized directory being watched.
    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }

    /// Waits for the next event.
    ///
    /// `Some(Err(_))` is a single bad event and the stream may continue;
    /// `None` means the watcher itself has gone away.
    pub async fn next_event(&mut self) -> Option<Result<DirEvent, WatchError>> {
        futures_util::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Stops watching and releases the underlying watcher.
    pub fn close(mut self) {
        use notify::Watcher;

        if let Err(e) = self.inner.unwatch(&self.directory) {
            tracing::debug!(directory = %self.directory.display(), error = %e, "unwatch failed");
        }
    }

    fn handle_event(&mut self, event: notify::Event) {
        let created = match event.kind {
            notify::EventKind::Create(notify::event::CreateKind::File) => true,
            // Windows and some backends report `Any`, so check the path
            notify::EventKind::Create(notify::event::CreateKind::Any) => true,
            _ => false,
        };

        if !created {
            self.pending.push_back(DirEvent::Other);
            return;
        }

        for path in event.paths {
            if path.parent() == Some(self.directory.as_path()) && path.is_file() {
                self.pending.push_back(DirEvent::Created(path));
            } else {
                self.pending.push_back(DirEvent::Other);
            }
        }
    }
}

impl FuturesStream for DirEvents {
    type Item = Result<DirEvent, WatchError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return task::Poll::Ready(Some(Ok(event)));
            }

            match ready!(self.event_stream.poll_recv(cx)) {
                Some(Ok(event)) => self.handle_event(event),
                Some(Err(e)) => return task::Poll::Ready(Some(Err(into_io_error(e).into()))),
                None => return task::Poll::Ready(None),
            }
        }
    }
}

fn into_io_error(e: notify::Error) -> io::Error {
    match e.kind {
        notify::ErrorKind::Io(io_err) => io_err,
        // Runtime event errors should only be std::io, but need to handle
        // this case anyway.
        kind => io::Error::new(io::ErrorKind::Other, format!("Event error: {:?}", kind)),
    }
}

/// Makes `path` absolute and resolves symlinks, so that it matches the paths
/// contained in each `notify::Event`.
fn absolutify(path: &Path) -> io::Result<PathBuf> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    Ok(path.canonicalize().unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::StreamExt;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn next_created(events: &mut DirEvents) -> PathBuf {
        loop {
            let event = timeout(Duration::from_secs(2), events.next())
                .await
                .expect("timed out waiting for event")
                .expect("watcher closed");
            if let Ok(DirEvent::Created(path)) = event {
                return path;
            }
        }
    }

    #[test]
    fn test_watch_file_fails() {
        let tmp_dir = tempdir().unwrap();
        let file_path = tmp_dir.path().join("file.txt");
        std::fs::write(&file_path, "").unwrap();

        assert!(matches!(
            DirEvents::watch(&file_path),
            Err(WatchError::AddFailure(_))
        ));
    }

    #[test]
    fn test_watch_missing_fails() {
        let tmp_dir = tempdir().unwrap();

        assert!(DirEvents::watch(tmp_dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_absolutify_relative() {
        let abs = absolutify(Path::new("some-relative-file.log")).unwrap();

        assert!(abs.is_absolute());
        assert!(abs.ends_with("some-relative-file.log"));
    }

    #[tokio::test]
    async fn test_created_files_reported() {
        let tmp_dir = tempdir().unwrap();
        let mut events = DirEvents::watch(tmp_dir.path()).unwrap();
        let dir = events.directory().to_path_buf();

        std::fs::write(dir.join("one.log"), "").unwrap();
        assert_eq!(next_created(&mut events).await, dir.join("one.log"));

        std::fs::write(dir.join("two.log"), "").unwrap();
        assert_eq!(next_created(&mut events).await, dir.join("two.log"));

        events.close();
    }

    #[tokio::test]
    async fn test_directories_not_reported_as_created() {
        let tmp_dir = tempdir().unwrap();
        let mut events = DirEvents::watch(tmp_dir.path()).unwrap();
        let dir = events.directory().to_path_buf();

        std::fs::create_dir(dir.join("subdir")).unwrap();
        std::fs::write(dir.join("after.log"), "").unwrap();

        assert_eq!(next_created(&mut events).await, dir.join("after.log"));
    }
}
