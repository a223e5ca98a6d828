use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use ping_ledger::{
    Cadence, EchoLink, EventStore, Fleet, Reachability, SqliteStore, Tracker, Transport,
    TransportError,
};

/// Answers echoes while the shared switch is on, stays silent otherwise.
#[derive(Clone)]
struct SwitchLink {
    reachable: Arc<AtomicBool>,
}

impl EchoLink for SwitchLink {
    fn echo(
        &self,
        _seq: u16,
    ) -> impl Future<Output = Result<Option<Duration>, TransportError>> + Send + 'static {
        let reachable = self.reachable.load(Ordering::SeqCst);
        async move {
            if reachable {
                time::sleep(Duration::from_millis(8)).await;
                Ok(Some(Duration::from_millis(8)))
            } else {
                time::sleep(Duration::from_secs(10)).await;
                Ok(None)
            }
        }
    }
}

/// "up" and "flappy" answer until their switch is turned off; any other
/// address never answers.
struct SwitchBoard {
    up: Arc<AtomicBool>,
    flappy: Arc<AtomicBool>,
}

impl Transport for SwitchBoard {
    type Link = SwitchLink;

    async fn open(&self, address: &str) -> Result<SwitchLink, TransportError> {
        let reachable = match address {
            "up" => self.up.clone(),
            "flappy" => self.flappy.clone(),
            _ => Arc::new(AtomicBool::new(false)),
        };
        Ok(SwitchLink { reachable })
    }
}

struct Harness {
    fleet: Fleet<SwitchBoard>,
    tracker: tokio::task::JoinHandle<Result<Tracker<SqliteStore>, ping_ledger::TrackerError>>,
    flappy: Arc<AtomicBool>,
    dir: tempfile::TempDir,
}

fn start(hosts: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("ledger.sqlite")).unwrap();
    let (tx, rx) = mpsc::channel(100);
    let tracker = tokio::spawn(Tracker::new(store).run(rx, CancellationToken::new()));

    let flappy = Arc::new(AtomicBool::new(true));
    let board = SwitchBoard {
        up: Arc::new(AtomicBool::new(true)),
        flappy: flappy.clone(),
    };
    let fleet = Fleet::new(board, Cadence::default(), tx, CancellationToken::new());
    for host in hosts {
        assert!(fleet.add_host(host));
    }
    Harness {
        fleet,
        tracker,
        flappy,
        dir,
    }
}

impl Harness {
    async fn stop(self) -> (Tracker<SqliteStore>, tempfile::TempDir) {
        self.fleet.shutdown().await;
        let tracker = self.tracker.await.unwrap().unwrap();
        (tracker, self.dir)
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_host_accumulates_one_growing_offline_interval() {
    let harness = start(&["down"]);
    time::sleep(Duration::from_secs(90)).await;
    let (tracker, _dir) = harness.stop().await;

    let down = tracker.open_event("down").unwrap();
    assert!(!down.online);
    assert!(down.duration >= TimeDelta::seconds(60), "offline for {}", down.duration);

    let later = Utc::now() + TimeDelta::days(1);
    let samples = tracker
        .store()
        .query_interval("down", down.started_at, later)
        .unwrap();
    assert!(samples.len() >= 60, "only {} samples archived", samples.len());
    assert!(samples.iter().all(|s| !s.is_online()));
    assert!(samples.windows(2).all(|w| w[0].at < w[1].at));
}

#[tokio::test(start_paused = true)]
async fn reachable_host_stays_in_one_online_interval() {
    let harness = start(&["up"]);
    time::sleep(Duration::from_secs(20)).await;
    let (tracker, _dir) = harness.stop().await;

    let open = tracker.open_events();
    assert_eq!(open.len(), 1);
    assert!(open[0].online);
    assert!(open[0].duration >= TimeDelta::seconds(15));

    let (stored, closed) = tracker
        .store()
        .load_event("up", open[0].started_at, Reachability::Online)
        .unwrap()
        .unwrap();
    assert!(!closed);
    assert_eq!(stored.duration_ms(), open[0].duration_ms());
}

#[tokio::test(start_paused = true)]
async fn outage_closes_the_online_interval() {
    let harness = start(&["flappy"]);
    time::sleep(Duration::from_secs(10)).await;
    harness.flappy.store(false, Ordering::SeqCst);
    time::sleep(Duration::from_secs(30)).await;
    let (tracker, _dir) = harness.stop().await;

    let offline = tracker.open_event("flappy").unwrap().clone();
    assert!(!offline.online);

    let store = tracker.store();
    let first = store
        .query_interval("flappy", offline.started_at - TimeDelta::hours(1), offline.started_at)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert!(first.is_online());

    let (online, closed) = store
        .load_event("flappy", first.at, Reachability::Online)
        .unwrap()
        .unwrap();
    assert!(closed);
    assert!(online.online);
    let expected = (offline.started_at - first.at).num_milliseconds();
    assert!((online.duration.num_milliseconds() - expected).abs() <= 1);
    assert_eq!(store.list_addresses().unwrap(), vec!["flappy".to_string()]);
}
