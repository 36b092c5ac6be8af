//! Everything related to reading appended lines from a single file.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures_util::stream::{self, Stream};
use tokio::fs::{metadata, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader, Take};

use crate::wake::{Wake, WakeHub};

type FileReader = BufReader<File>;

async fn new_filereader(path: &Path, start: StartAt) -> io::Result<(FileReader, u64, Option<FileId>)> {
    let mut file = File::open(path).await?;
    let meta = file.metadata().await?;

    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Tailed path is not a regular file",
        ));
    }

    let pos = match start {
        StartAt::Beginning => 0,
        StartAt::End => meta.len(),
    };
    file.seek(io::SeekFrom::Start(pos)).await?;

    Ok((BufReader::new(file), pos, file_id(&meta)))
}

type FileId = (u64, u64);

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<FileId> {
    None
}

/// Strips the line terminator and decodes lossily.
fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    if bytes[..end].ends_with(b"\n") {
        end -= 1;
    }
    if bytes[..end].ends_with(b"\r") {
        end -= 1;
    }

    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Where a new [`LineReader`] starts reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartAt {
    /// Skip existing content and follow new appends only.
    End,
    /// Replay existing content, then follow.
    Beginning,
}

/// A single line captured from a tailed file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Line {
    /// The path from where the line was read.
    source: PathBuf,
    /// The line content, without its line terminator.
    line: String,
    /// When the line was read.
    received_at: SystemTime,
}

impl Line {
    pub fn new(source: impl Into<PathBuf>, line: impl Into<String>) -> Self {
        Line {
            source: source.into(),
            line: line.into(),
            received_at: SystemTime::now(),
        }
    }

    /// Returns a reference to the file from where the line was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns the line content.
    pub fn line(&self) -> &str {
        self.line.as_str()
    }

    /// Returns the time at which the line was read.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Returns the internal components that make up a `Line`.
    pub fn into_inner(self) -> (PathBuf, String) {
        let Line { source, line, .. } = self;

        (source, line)
    }
}

enum Rotation {
    Unchanged,
    Reopened,
    Removed,
}

/// Second handle over the content skipped at open, see [`LineReader::rewind`].
struct Replay {
    reader: BufReader<Take<File>>,
    buf: Vec<u8>,
}

/// Follows a single file, yielding each complete line as it is appended.
///
/// Incomplete trailing lines are buffered until their newline arrives. If the
/// file is truncated below the read position, or the path is replaced by a
/// different file, the reader starts over from the beginning. If the path
/// disappears, the sequence ends.
pub struct LineReader {
    path: PathBuf,
    reader: FileReader,
    /// Offset of the first byte in `buf`.
    pos: u64,
    file_id: Option<FileId>,
    buf: Vec<u8>,
    /// Bytes before the opening position that were never handed out.
    skipped: u64,
    replay: Option<Replay>,
    finished: bool,
    poll_interval: Duration,
    wake: Option<Wake>,
}

impl fmt::Debug for LineReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("LineReader")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .field("buffered", &self.buf.len())
            .field("skipped", &self.skipped)
            .field("replaying", &self.replay.is_some())
            .field("finished", &self.finished)
            .field("event_driven", &self.wake.is_some())
            .finish()
    }
}

impl LineReader {
    /// Opens `path` for tailing, positioned according to `start`.
    pub async fn open(
        path: impl Into<PathBuf>,
        start: StartAt,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        Self::open_with(path, start, poll_interval, &WakeHub::new()).await
    }

    /// Like [`LineReader::open`], taking wake-ups from a shared watcher.
    pub(crate) async fn open_with(
        path: impl Into<PathBuf>,
        start: StartAt,
        poll_interval: Duration,
        wakes: &WakeHub,
    ) -> io::Result<Self> {
        let path = path.into();
        let (reader, pos, file_id) = new_filereader(&path, start).await?;

        let wake = wakes.register(&path);
        if wake.is_none() {
            tracing::debug!(path = %path.display(), "file watch unavailable, polling only");
        }

        Ok(LineReader {
            path,
            reader,
            pos,
            file_id,
            buf: Vec::new(),
            skipped: pos,
            replay: None,
            finished: false,
            poll_interval,
            wake,
        })
    }

    /// Returns the path being followed.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Returns the offset just past the last complete line handed out.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Waits for the next complete line.
    ///
    /// Returns `Ok(None)` once the file has been removed. An `Err` means the
    /// reader can no longer make progress and should be dropped.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        if let Some(line) = self.next_replayed().await? {
            return Ok(Some(line));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            // Partially read bytes stay in `buf`, so this survives cancellation.
            self.reader.read_until(b'\n', &mut self.buf).await?;

            if self.buf.last() == Some(&b'\n') {
                return Ok(Some(self.take_line()));
            }

            match self.check_rotation().await? {
                Rotation::Unchanged => self.wait().await,
                Rotation::Reopened => continue,
                Rotation::Removed => {
                    self.finished = true;

                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    // Hand out whatever was left without its newline.
                    return Ok(Some(self.take_line()));
                }
            }
        }
    }

    /// Turns the reader into a stream that ends when the file goes away or
    /// after the first error.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Line>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Also hands out the content that was skipped because the reader was
    /// opened at the end of the file.
    ///
    /// If no line has been handed out yet, the reader simply starts over from
    /// the first byte. Otherwise the skipped content follows the lines already
    /// handed out, and reading then carries on where it was. Does nothing if
    /// the path now names a different file, or after a rotation.
    pub async fn rewind(&mut self) -> io::Result<()> {
        if self.skipped == 0 {
            return Ok(());
        }

        let meta = match metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let current_id = file_id(&meta);
        if current_id.is_some() && current_id != self.file_id {
            return Ok(());
        }

        if self.pos == self.skipped {
            let (reader, pos, file_id) = new_filereader(&self.path, StartAt::Beginning).await?;
            self.reader = reader;
            self.pos = pos;
            self.file_id = file_id;
            self.buf.clear();
        } else {
            let file = File::open(&self.path).await?;
            self.replay = Some(Replay {
                reader: BufReader::new(file.take(self.skipped)),
                buf: Vec::new(),
            });
        }

        tracing::debug!(path = %self.path.display(), skipped = self.skipped, "rewinding");
        self.skipped = 0;

        Ok(())
    }

    async fn next_replayed(&mut self) -> io::Result<Option<Line>> {
        let replay = match self.replay.as_mut() {
            Some(replay) => replay,
            None => return Ok(None),
        };

        let read = replay.reader.read_until(b'\n', &mut replay.buf).await?;
        let bytes = std::mem::take(&mut replay.buf);
        // The last piece may be the head of a line that straddles the
        // opening position.
        if read == 0 || !bytes.ends_with(b"\n") {
            self.replay = None;
        }
        if bytes.is_empty() {
            return Ok(None);
        }

        Ok(Some(Line::new(self.path.clone(), decode_line(&bytes))))
    }

    fn take_line(&mut self) -> Line {
        let consumed = self.buf.len() as u64;
        let text = decode_line(&self.buf);
        self.buf.clear();
        self.pos += consumed;

        Line::new(self.path.clone(), text)
    }

    async fn check_rotation(&mut self) -> io::Result<Rotation> {
        let meta = match metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Rotation::Removed),
            Err(e) => return Err(e),
        };

        let read_to = self.pos + self.buf.len() as u64;
        let current_id = file_id(&meta);
        let replaced = current_id.is_some() && current_id != self.file_id;

        if !replaced && meta.len() >= read_to {
            return Ok(Rotation::Unchanged);
        }

        // rolled
        tracing::debug!(
            path = %self.path.display(),
            replaced,
            size = meta.len(),
            pos = read_to,
            "file rotated, reading from the beginning"
        );
        let (reader, pos, file_id) = new_filereader(&self.path, StartAt::Beginning).await?;
        self.reader = reader;
        self.pos = pos;
        self.file_id = file_id;
        self.buf.clear();
        self.skipped = 0;

        Ok(Rotation::Reopened)
    }

    async fn wait(&mut self) {
        let interval = self.poll_interval;

        let closed = match self.wake.as_mut() {
            Some(wake) => tokio::select! {
                alive = wake.changed() => !alive,
                _ = tokio::time::sleep(interval) => false,
            },
            None => {
                tokio::time::sleep(interval).await;
                false
            }
        };

        if closed {
            self.wake = None;
        }
    }
}
