//! Wake-ups for file readers, fanned out from one shared filesystem watcher.
//!
//! Each reader registers its path and gets a [`Wake`] that fires whenever the
//! watcher reports an event for that path. The hub watches parent directories
//! (not the files themselves), so a watch never follows a file that was
//! rotated away, and all files in one directory share a single watch.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(Default)]
struct Routes {
    files: HashMap<PathBuf, Vec<(u64, mpsc::Sender<()>)>>,
    /// Watched directories and how many registrations live in each.
    dirs: HashMap<PathBuf, usize>,
    next_id: u64,
}

struct Inner {
    routes: Arc<Mutex<Routes>>,
    /// `None` until first use, or while the watcher cannot be built.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to a shared watcher.
#[derive(Clone)]
pub(crate) struct WakeHub {
    inner: Arc<Inner>,
}

impl fmt::Debug for WakeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = lock(&self.inner.routes);
        f.debug_struct("WakeHub")
            .field("files", &routes.files.len())
            .field("dirs", &routes.dirs.len())
            .finish()
    }
}

impl WakeHub {
    pub(crate) fn new() -> Self {
        WakeHub {
            inner: Arc::new(Inner {
                routes: Arc::new(Mutex::new(Routes::default())),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Registers `path` for wake-ups.
    ///
    /// Returns `None` if the platform watcher is unavailable, in which case
    /// the caller has to rely on polling alone.
    pub(crate) fn register(&self, path: &Path) -> Option<Wake> {
        let file_name = path.file_name()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        // Events carry the watched directory joined with the file name.
        let key = dir.join(file_name);

        // Held throughout so that watching and unwatching a directory never
        // interleave. The routes lock is never held while calling into the
        // watcher, whose thread takes it to deliver events.
        let mut guard = lock(&self.inner.watcher);
        if guard.is_none() {
            *guard = self.build_watcher();
        }
        let watcher = guard.as_mut()?;

        let first_in_dir = !lock(&self.inner.routes).dirs.contains_key(&dir);
        if first_in_dir {
            if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                tracing::debug!(dir = %dir.display(), error = %e, "cannot watch directory");
                return None;
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let mut routes = lock(&self.inner.routes);
        let id = routes.next_id;
        routes.next_id += 1;
        routes.files.entry(key.clone()).or_default().push((id, tx));
        *routes.dirs.entry(dir.clone()).or_insert(0) += 1;

        Some(Wake {
            rx,
            id,
            key,
            dir,
            hub: Arc::clone(&self.inner),
        })
    }

    fn build_watcher(&self) -> Option<RecommendedWatcher> {
        let routes = Arc::clone(&self.inner.routes);

        let res = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(_) => return,
            };
            let routes = lock(&routes);
            for path in &event.paths {
                if let Some(wakes) = routes.files.get(path) {
                    for (_, tx) in wakes {
                        // A full channel already holds a pending wake-up.
                        let _ = tx.try_send(());
                    }
                }
            }
        });

        match res {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::debug!(error = %e, "file watcher unavailable, polling only");
                None
            }
        }
    }
}

/// A registration with a [`WakeHub`]. Unregisters on drop.
pub(crate) struct Wake {
    rx: mpsc::Receiver<()>,
    id: u64,
    key: PathBuf,
    dir: PathBuf,
    hub: Arc<Inner>,
}

impl Wake {
    /// Waits for the next event on the registered path. Returns `false` if
    /// the watcher has gone away.
    pub(crate) async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

impl Drop for Wake {
    fn drop(&mut self) {
        let mut guard = lock(&self.hub.watcher);
        let last_in_dir = {
            let mut routes = lock(&self.hub.routes);
            if let Some(wakes) = routes.files.get_mut(&self.key) {
                wakes.retain(|(id, _)| *id != self.id);
                if wakes.is_empty() {
                    routes.files.remove(&self.key);
                }
            }
            match routes.dirs.get_mut(&self.dir) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    routes.dirs.remove(&self.dir);
                    true
                }
                None => false,
            }
        };

        if last_in_dir {
            if let Some(watcher) = guard.as_mut() {
                let _ = watcher.unwatch(&self.dir);
            }
        }
    }
}
