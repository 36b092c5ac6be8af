//! Owns the set of per-file readers and pumps their lines into the publisher.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::error::TailError;
use crate::publisher::Publisher;
use crate::reader::{LineReader, StartAt};
use crate::wake::WakeHub;

/// How a file came to be tracked.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Origin {
    /// Present when the directory was first scanned. Tailed from its end.
    Existing,
    /// Created after watching began. Tailed from its first byte.
    Discovered,
}

/// A file under supervision.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TrackedFile {
    path: PathBuf,
    origin: Origin,
}

impl TrackedFile {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }
}

struct Entry {
    generation: u64,
    origin: Origin,
    /// A create event arrived for the path while this reader was running.
    recreated: bool,
    /// Asks an `Existing` reader to also deliver what it skipped at open.
    rewind: Arc<Notify>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<PathBuf, Entry>,
    next_generation: u64,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts one reader task per tracked file and stops them all on demand.
///
/// Every reader task owns a [`Publisher`] clone; the publisher only closes
/// once all of them have exited and the manager itself is dropped. Dropping
/// the manager also stops its readers.
pub struct TailManager {
    publisher: Publisher,
    registry: Arc<Mutex<Registry>>,
    token: CancellationToken,
    tracker: TaskTracker,
    wakes: WakeHub,
    poll_interval: Duration,
    _guard: DropGuard,
}

impl fmt::Debug for TailManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailManager")
            .field("tracked", &lock(&self.registry).entries.len())
            .field("stopped", &self.token.is_cancelled())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

impl TailManager {
    pub fn new(publisher: Publisher, config: &Config) -> Self {
        Self::with_cancellation(publisher, config, CancellationToken::new())
    }

    /// Like [`TailManager::new`], but readers also stop when `token` is
    /// cancelled.
    pub fn with_cancellation(
        publisher: Publisher,
        config: &Config,
        token: CancellationToken,
    ) -> Self {
        let token = token.child_token();

        TailManager {
            publisher,
            registry: Arc::new(Mutex::new(Registry::default())),
            _guard: token.clone().drop_guard(),
            token,
            tracker: TaskTracker::new(),
            wakes: WakeHub::new(),
            poll_interval: config.poll_interval,
        }
    }

    /// Scans `directory` once, non-recursively, and follows every regular
    /// file found from its current end.
    ///
    /// Returns the files that were started. Files already tracked are
    /// skipped, and a file that cannot be opened is logged and skipped.
    pub async fn discover(&self, directory: impl AsRef<Path>) -> Result<Vec<TrackedFile>, TailError> {
        let directory = directory.as_ref();
        let directory = match tokio::fs::canonicalize(directory).await {
            Ok(directory) => directory,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TailError::NotADirectory(directory.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        if !tokio::fs::metadata(&directory).await?.is_dir() {
            return Err(TailError::NotADirectory(directory));
        }

        let mut entries = tokio::fs::read_dir(&directory).await?;
        let mut started = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            // Follows symlinks, unlike `DirEntry::file_type`.
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                _ => continue,
            }

            match self.start(path, Origin::Existing).await {
                Ok(Some(tracked)) => started.push(tracked),
                Ok(None) => {}
                Err(TailError::Stopped) => return Err(TailError::Stopped),
                Err(e) => tracing::warn!(error = %e, "skipping file during discovery"),
            }
        }

        started.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::info!(
            directory = %directory.display(),
            files = started.len(),
            "discovered existing files"
        );

        Ok(started)
    }

    /// Follows a newly created file from its first byte.
    ///
    /// Returns `Ok(None)` if the path is already tracked. If it was tracked
    /// from its end by [`discover`](Self::discover), the file appeared after
    /// watching began but before the scan, so its reader is told to deliver
    /// the content it skipped as well.
    pub async fn track_new(&self, path: impl Into<PathBuf>) -> Result<Option<TrackedFile>, TailError> {
        self.start(path.into(), Origin::Discovered).await
    }

    /// Stops every reader. Idempotent, and fine to call when readers have
    /// already ended on their own.
    pub fn stop_all(&self) {
        if !self.token.is_cancelled() {
            tracing::info!(readers = self.tracker.len(), "stopping all readers");
        }
        self.token.cancel();
        self.tracker.close();
    }

    /// Waits until every reader task has exited.
    ///
    /// Without a prior [`stop_all`](Self::stop_all) this waits for the files
    /// themselves to go away.
    pub async fn join(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_tracked(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.registry).entries.contains_key(path.as_ref())
    }

    /// Snapshot of the files whose readers are still running.
    pub fn tracked(&self) -> Vec<TrackedFile> {
        let mut files: Vec<_> = lock(&self.registry)
            .entries
            .iter()
            .map(|(path, entry)| TrackedFile {
                path: path.clone(),
                origin: entry.origin,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    async fn start(&self, path: PathBuf, origin: Origin) -> Result<Option<TrackedFile>, TailError> {
        if self.token.is_cancelled() {
            return Err(TailError::Stopped);
        }
        if let Some(entry) = lock(&self.registry).entries.get_mut(&path) {
            if origin == Origin::Discovered {
                entry.recreated = true;
                if entry.origin == Origin::Existing {
                    entry.rewind.notify_one();
                }
            }
            return Ok(None);
        }

        let start_at = match origin {
            Origin::Existing => StartAt::End,
            Origin::Discovered => StartAt::Beginning,
        };
        let reader = LineReader::open_with(&path, start_at, self.poll_interval, &self.wakes)
            .await
            .map_err(|source| TailError::Open {
                path: path.clone(),
                source,
            })?;

        let rewind = Arc::new(Notify::new());
        let generation = {
            let mut registry = lock(&self.registry);
            if self.token.is_cancelled() {
                return Err(TailError::Stopped);
            }
            // Lost a race with another start for the same path
            if registry.entries.contains_key(&path) {
                return Ok(None);
            }

            let generation = registry.next_generation;
            registry.next_generation += 1;
            registry.entries.insert(
                path.clone(),
                Entry {
                    generation,
                    origin,
                    recreated: false,
                    rewind: Arc::clone(&rewind),
                },
            );
            generation
        };

        tracing::info!(path = %path.display(), ?origin, "tailing file");

        self.tracker.spawn(follow(
            reader,
            Follow {
                publisher: self.publisher.clone(),
                token: self.token.child_token(),
                registry: Arc::clone(&self.registry),
                generation,
                rewind,
                wakes: self.wakes.clone(),
                poll_interval: self.poll_interval,
            },
        ));

        Ok(Some(TrackedFile { path, origin }))
    }
}

/// What a reader task needs besides its reader.
struct Follow {
    publisher: Publisher,
    token: CancellationToken,
    registry: Arc<Mutex<Registry>>,
    generation: u64,
    rewind: Arc<Notify>,
    wakes: WakeHub,
    poll_interval: Duration,
}

/// Pumps one reader into the publisher until the file goes away, the reader
/// fails, or the token is cancelled. Unregisters the file on exit.
async fn follow(mut reader: LineReader, ctx: Follow) {
    let path = reader.path().to_path_buf();

    loop {
        let line = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            _ = ctx.rewind.notified() => {
                if let Err(e) = reader.rewind().await {
                    tracing::warn!(path = %path.display(), error = %e, "rewind failed");
                }
                continue;
            }
            res = reader.next_line() => match res {
                Ok(Some(line)) => line,
                Ok(None) => match ctx.reopen_if_recreated(&path).await {
                    Some(next) => {
                        tracing::info!(path = %path.display(), "file recreated, reading from the beginning");
                        reader = next;
                        continue;
                    }
                    None => {
                        tracing::info!(path = %path.display(), "file removed, reader finished");
                        return;
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "read failed, reader finished");
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            res = ctx.publisher.publish(line) => {
                if res.is_err() {
                    tracing::debug!(path = %path.display(), "publisher closed, reader finished");
                    break;
                }
            }
        }
    }

    ctx.unregister(&path);
}

impl Follow {
    /// Called once the file is gone. If a create event for the path was
    /// swallowed while this reader still held it, reopens the new file from
    /// its first byte. Otherwise unregisters, returning `None`.
    async fn reopen_if_recreated(&self, path: &Path) -> Option<LineReader> {
        loop {
            {
                let mut registry = lock(&self.registry);
                match registry.entries.get_mut(path) {
                    Some(entry) if entry.generation == self.generation => {
                        if !std::mem::take(&mut entry.recreated) {
                            registry.entries.remove(path);
                            return None;
                        }
                    }
                    _ => return None,
                }
            }

            match LineReader::open_with(path, StartAt::Beginning, self.poll_interval, &self.wakes).await {
                Ok(reader) => return Some(reader),
                // Gone again; a further create event sets the flag anew.
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "reopen failed"),
            }
        }
    }

    fn unregister(&self, path: &Path) {
        let mut registry = lock(&self.registry);
        // A newer reader may own the path by now
        if registry.entries.get(path).map(|e| e.generation) == Some(self.generation) {
            registry.entries.remove(path);
        }
    }
}
