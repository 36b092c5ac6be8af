use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dirtail::{
    ChannelConnector, Config, Connector, ConnectorError, DeliveryPolicy, DirEvents,
    DiscoveryLoop, Line, Origin, Pipeline, Publisher, Subscription, TailManager,
};
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const TIMEOUT_1_SEC: Duration = Duration::from_millis(1000);

fn config() -> Config {
    Config::default().with_poll_interval(Duration::from_millis(50))
}

fn append(path: &Path) -> File {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap()
}

async fn collect(rx: &mut UnboundedReceiver<Line>, n: usize) -> Vec<Line> {
    timeout(TIMEOUT_1_SEC, async {
        let mut lines = Vec::with_capacity(n);
        while lines.len() < n {
            lines.push(rx.recv().await.expect("connector channel closed"));
        }
        lines
    })
    .await
    .expect("timed out collecting lines")
}

fn texts(lines: &[Line]) -> Vec<&str> {
    lines.iter().map(|l| l.line()).collect()
}

fn by_file(lines: &[Line]) -> HashMap<PathBuf, Vec<String>> {
    let mut files: HashMap<PathBuf, Vec<String>> = HashMap::new();
    for line in lines {
        let name = PathBuf::from(line.source().file_name().unwrap());
        files.entry(name).or_default().push(line.line().to_string());
    }
    files
}

#[tokio::test]
pub async fn test_existing_then_new_file() {
    let logdir = tempdir().unwrap();
    let file_a = logdir.path().join("a.txt");
    std::fs::write(&file_a, "written before discovery\n").unwrap();

    let mut pipeline = Pipeline::new(logdir.path(), config());
    let (connector, mut rx) = ChannelConnector::new();
    pipeline.subscribe("only", connector).unwrap();

    let files = pipeline.start().await.unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].path().ends_with("a.txt"));

    let mut writer = append(&file_a);
    for i in 1..=5 {
        writeln!(writer, "L{}", i).unwrap();
        sleep(Duration::from_millis(10)).await;
    }

    let lines = collect(&mut rx, 5).await;
    assert_eq!(texts(&lines), vec!["L1", "L2", "L3", "L4", "L5"]);

    let mut writer = File::create(logdir.path().join("b.txt")).unwrap();
    for i in 1..=3 {
        writeln!(writer, "M{}", i).unwrap();
    }
    drop(writer);

    let lines = collect(&mut rx, 3).await;
    assert_eq!(texts(&lines), vec!["M1", "M2", "M3"]);
    assert!(lines.iter().all(|l| l.source().ends_with("b.txt")));

    let report = pipeline.shutdown().await;
    assert_eq!(report.discovery, Some(Ok(())));
    assert_eq!(report.subscribers.len(), 1);
    assert_eq!(report.subscribers[0].0, "only");
    assert_eq!(report.subscribers[0].1.delivered, 8);
    assert_eq!(report.metrics.lines_broadcast, 8);

    // Closing the connector closed its channel.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
pub async fn test_no_loss_across_files_and_subscribers() {
    const FILES: usize = 3;
    const LINES: usize = 20;

    let logdir = tempdir().unwrap();
    let paths: Vec<_> = (0..FILES)
        .map(|i| logdir.path().join(format!("file{}.log", i)))
        .collect();
    for path in &paths {
        File::create(path).unwrap();
    }

    let mut pipeline = Pipeline::new(logdir.path(), config());
    let mut receivers = Vec::new();
    for name in ["first", "second"] {
        let (connector, rx) = ChannelConnector::new();
        pipeline.subscribe(name, connector).unwrap();
        receivers.push(rx);
    }
    assert_eq!(pipeline.start().await.unwrap().len(), FILES);

    let mut writers: Vec<_> = paths.iter().map(|p| append(p)).collect();
    for n in 0..LINES {
        for (i, writer) in writers.iter_mut().enumerate() {
            writeln!(writer, "file{}-{}", i, n).unwrap();
        }
    }

    let mut orders = Vec::new();
    for rx in &mut receivers {
        let lines = collect(rx, FILES * LINES).await;
        let files = by_file(&lines);
        assert_eq!(files.len(), FILES);

        for i in 0..FILES {
            let expected: Vec<_> = (0..LINES).map(|n| format!("file{}-{}", i, n)).collect();
            assert_eq!(files[&PathBuf::from(format!("file{}.log", i))], expected);
        }
        orders.push(texts(&lines).iter().map(|t| t.to_string()).collect::<Vec<_>>());
    }

    // Every subscriber sees the same global order.
    assert_eq!(orders[0], orders[1]);

    let report = pipeline.shutdown().await;
    for (_, stats) in &report.subscribers {
        assert_eq!(stats.delivered, (FILES * LINES) as u64);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.dropped, 0);
    }
}

#[tokio::test]
pub async fn test_removed_file_does_not_affect_others() {
    let logdir = tempdir().unwrap();
    let doomed = logdir.path().join("doomed.log");
    let survivor = logdir.path().join("survivor.log");
    File::create(&doomed).unwrap();
    File::create(&survivor).unwrap();

    let mut pipeline = Pipeline::new(logdir.path(), config());
    let (connector, mut rx) = ChannelConnector::new();
    pipeline.subscribe("only", connector).unwrap();
    pipeline.start().await.unwrap();

    writeln!(append(&doomed), "last words").unwrap();
    assert_eq!(texts(&collect(&mut rx, 1).await), vec!["last words"]);

    std::fs::remove_file(&doomed).unwrap();
    timeout(TIMEOUT_1_SEC, async {
        while pipeline.manager().tracked().len() > 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reader for removed file still running");

    let mut writer = append(&survivor);
    for i in 0..3 {
        writeln!(writer, "still here {}", i).unwrap();
    }
    let lines = collect(&mut rx, 3).await;
    assert_eq!(
        texts(&lines),
        vec!["still here 0", "still here 1", "still here 2"]
    );

    pipeline.shutdown().await;
}

#[tokio::test]
pub async fn test_partial_line_waits_for_newline() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("foo.log");
    File::create(&logfile).unwrap();

    let mut pipeline = Pipeline::new(logdir.path(), config());
    let (connector, mut rx) = ChannelConnector::new();
    pipeline.subscribe("only", connector).unwrap();
    pipeline.start().await.unwrap();

    let mut writer = append(&logfile);
    write!(writer, "foo").unwrap();
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    writeln!(writer, " bar").unwrap();
    assert_eq!(texts(&collect(&mut rx, 1).await), vec!["foo bar"]);

    pipeline.shutdown().await;
}

/// Takes a while per line, so lines pile up in its slot.
struct SlowConnector {
    delivered: Vec<String>,
    done: Option<tokio::sync::oneshot::Sender<Vec<String>>>,
}

impl Connector for SlowConnector {
    async fn send(&mut self, line: &Line) -> Result<(), ConnectorError> {
        sleep(Duration::from_millis(20)).await;
        self.delivered.push(line.line().to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        let delivered = std::mem::take(&mut self.delivered);
        self.done
            .take()
            .ok_or(ConnectorError::Closed)?
            .send(delivered)
            .map_err(|_| ConnectorError::Other("receiver gone".into()))
    }
}

#[tokio::test]
pub async fn test_shutdown_drains_queued_lines() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("busy.log");
    File::create(&logfile).unwrap();

    let mut pipeline = Pipeline::new(logdir.path(), config());
    let (tx, done) = tokio::sync::oneshot::channel();
    pipeline
        .subscribe(
            "slow",
            SlowConnector {
                delivered: Vec::new(),
                done: Some(tx),
            },
        )
        .unwrap();
    pipeline.start().await.unwrap();

    let mut writer = append(&logfile);
    for i in 0..10 {
        writeln!(writer, "queued {}", i).unwrap();
    }

    // Wait until every line has left the readers, but not the slot.
    timeout(TIMEOUT_1_SEC, async {
        while pipeline.publisher().metrics().lines_broadcast < 10 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let report = timeout(Duration::from_secs(2), pipeline.shutdown())
        .await
        .expect("shutdown hung");
    assert_eq!(report.subscribers[0].1.delivered, 10);
    assert_eq!(report.subscribers[0].1.close_error, None);

    let delivered = done.await.unwrap();
    let expected: Vec<_> = (0..10).map(|i| format!("queued {}", i)).collect();
    assert_eq!(delivered, expected);
}

#[tokio::test]
pub async fn test_shutdown_token_stops_everything() {
    let logdir = tempdir().unwrap();
    File::create(logdir.path().join("a.log")).unwrap();

    let mut pipeline = Pipeline::new(logdir.path(), config());
    let (connector, mut rx) = ChannelConnector::new();
    pipeline
        .subscribe_with("lossy", DeliveryPolicy::DropNewest, connector)
        .unwrap();
    pipeline.start().await.unwrap();

    let token = pipeline.shutdown_token();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let report = timeout(
        TIMEOUT_1_SEC,
        pipeline.run_until(std::future::pending::<()>()),
    )
    .await
    .expect("pipeline did not stop");

    assert_eq!(report.discovery, Some(Ok(())));
    assert_eq!(report.subscribers[0].1.delivered, 0);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
pub async fn test_start_twice_fails() {
    let logdir = tempdir().unwrap();

    let mut pipeline = Pipeline::new(logdir.path(), config());
    pipeline.start().await.unwrap();
    assert!(matches!(
        pipeline.start().await,
        Err(dirtail::Error::AlreadyStarted)
    ));

    pipeline.shutdown().await;
}

#[tokio::test]
pub async fn test_start_on_missing_directory_fails() {
    let logdir = tempdir().unwrap();

    let mut pipeline = Pipeline::new(logdir.path().join("missing"), config());
    assert!(matches!(
        pipeline.start().await,
        Err(dirtail::Error::Watch(_))
    ));

    pipeline.shutdown().await;
}

async fn recv_text(sub: &mut Subscription) -> String {
    timeout(TIMEOUT_1_SEC, sub.recv())
        .await
        .expect("timed out waiting for line")
        .expect("subscription closed")
        .line()
        .to_string()
}

/// Same order as `Pipeline::start`: watch, scan, then handle events. `late`
/// is created between the watch and the scan.
async fn start_with_file_created_during_scan(
    dir: &Path,
    late: &Path,
) -> (Arc<TailManager>, Subscription, DiscoveryLoop<DirEvents>) {
    let config = config();
    let (publisher, broadcaster) = Publisher::new(&config);
    tokio::spawn(broadcaster.run());
    let sub = publisher.subscribe("only").unwrap();
    let manager = Arc::new(TailManager::new(publisher, &config));

    let events = DirEvents::watch(dir).unwrap();
    std::fs::write(late, "first\n").unwrap();

    let files = manager.discover(events.directory()).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].origin(), Origin::Existing);

    let discovery = DiscoveryLoop::new(events, Arc::clone(&manager), CancellationToken::new());
    (manager, sub, discovery)
}

#[tokio::test]
pub async fn test_file_created_during_scan_is_read_from_start() {
    let logdir = tempdir().unwrap();
    let late = logdir.path().join("late.log");

    let (manager, mut sub, discovery) =
        start_with_file_created_during_scan(logdir.path(), &late).await;
    tokio::spawn(discovery.run());

    assert_eq!(recv_text(&mut sub).await, "first");
    writeln!(append(&late), "second").unwrap();
    assert_eq!(recv_text(&mut sub).await, "second");
    assert!(timeout(Duration::from_millis(200), sub.recv()).await.is_err());

    manager.stop_all();
    timeout(TIMEOUT_1_SEC, manager.join()).await.unwrap();
}

#[tokio::test]
pub async fn test_file_created_during_scan_keeps_lines_read_since() {
    let logdir = tempdir().unwrap();
    let late = logdir.path().join("late.log");

    let (manager, mut sub, discovery) =
        start_with_file_created_during_scan(logdir.path(), &late).await;

    // Read past the scan position before the create event is handled.
    writeln!(append(&late), "second").unwrap();
    assert_eq!(recv_text(&mut sub).await, "second");

    tokio::spawn(discovery.run());
    assert_eq!(recv_text(&mut sub).await, "first");
    writeln!(append(&late), "third").unwrap();
    assert_eq!(recv_text(&mut sub).await, "third");
    assert!(timeout(Duration::from_millis(200), sub.recv()).await.is_err());

    manager.stop_all();
    timeout(TIMEOUT_1_SEC, manager.join()).await.unwrap();
}
