#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_controller::{Controller, ControllerConfig, ControllerError, ErrorReporter, LogErrorReporter, ReconcileError};
use vigil_core::{ContainerState, DerivedStatus, Notification, ObjectKey, PodSnapshot};
use vigil_kubehub::ChangeNotifier;
use vigil_queue::ItemExponentialRateLimiter;
use vigil_sink::{SinkError, StatusSink};

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<(String, String, DerivedStatus)>>,
    /// Reports for this pod name fail with a 500.
    fail_name: Option<String>,
}

impl RecordingSink {
    fn count(&self) -> usize { self.calls.lock().unwrap().len() }

    fn names(&self) -> Vec<String> { self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect() }
}

#[async_trait::async_trait]
impl StatusSink for RecordingSink {
    async fn report(&self, name: &str, id: &str, status: DerivedStatus) -> Result<(), SinkError> {
        self.calls.lock().unwrap().push((name.to_string(), id.to_string(), status));
        if self.fail_name.as_deref() == Some(name) {
            return Err(SinkError::Status { code: 500 });
        }
        Ok(())
    }
}

struct PanickingReporter;

impl ErrorReporter for PanickingReporter {
    fn report(&self, key: &ObjectKey, _err: &ReconcileError) {
        panic!("reporter failed for {key}");
    }
}

/// Emits a fixed script of notifications, then idles until stopped.
struct ScriptedNotifier {
    script: Vec<Notification>,
}

#[async_trait::async_trait]
impl ChangeNotifier for ScriptedNotifier {
    async fn run(&self, tx: mpsc::Sender<Notification>, stop: CancellationToken) -> anyhow::Result<()> {
        for n in self.script.clone() {
            if tx.send(n).await.is_err() {
                return Ok(());
            }
        }
        stop.cancelled().await;
        Ok(())
    }
}

/// Emits its script and returns without waiting for the stop signal.
struct ExitingNotifier {
    script: Vec<Notification>,
    fail: bool,
}

#[async_trait::async_trait]
impl ChangeNotifier for ExitingNotifier {
    async fn run(&self, tx: mpsc::Sender<Notification>, _stop: CancellationToken) -> anyhow::Result<()> {
        for n in self.script.clone() {
            tx.send(n).await?;
        }
        if self.fail {
            anyhow::bail!("watch stream broke");
        }
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait::async_trait]
impl ChangeNotifier for FailingNotifier {
    async fn run(&self, _tx: mpsc::Sender<Notification>, _stop: CancellationToken) -> anyhow::Result<()> {
        anyhow::bail!("api server unreachable")
    }
}

fn selected_pod(name: &str) -> PodSnapshot {
    PodSnapshot::new(Some("ns"), name)
        .with_label("status-controller-vcluster", "cluster-manager")
        .with_label("status-controller", &format!("id-{name}"))
        .with_container(ContainerState::Running)
}

fn controller(cfg: ControllerConfig, sink: Arc<RecordingSink>) -> Controller {
    let limiter = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
    Controller::new(cfg, limiter, sink, Arc::new(LogErrorReporter))
}

async fn wait_for_reports(sink: &RecordingSink, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reports did not arrive in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_after_sync_and_stops_cleanly() {
    let sink = Arc::new(RecordingSink::default());
    let c = controller(ControllerConfig::default(), sink.clone());
    let queue = c.queue();
    let notifier = Arc::new(ScriptedNotifier {
        script: vec![
            Notification::Resynced(vec![selected_pod("pod-a")]),
            Notification::Applied(selected_pod("pod-b")),
        ],
    });
    let stop = CancellationToken::new();
    let handle = tokio::spawn(c.run(notifier, stop.clone()));

    wait_for_reports(&sink, 2).await;
    stop.cancel();
    let res = tokio::time::timeout(Duration::from_secs(5), handle).await.expect("run did not return").unwrap();
    assert!(res.is_ok(), "{res:?}");
    assert!(queue.is_shutting_down());

    let mut calls = sink.calls.lock().unwrap().clone();
    calls.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        calls,
        vec![
            ("pod-a".to_string(), "id-pod-a".to_string(), DerivedStatus::Running),
            ("pod-b".to_string(), "id-pod-b".to_string(), DerivedStatus::Running),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_workers_process_every_key() {
    let sink = Arc::new(RecordingSink::default());
    let cfg = ControllerConfig { workers: 4, ..Default::default() };
    let c = controller(cfg, sink.clone());
    let pods = (0..20).map(|i| selected_pod(&format!("pod-{i}"))).collect();
    let notifier = Arc::new(ScriptedNotifier { script: vec![Notification::Resynced(pods)] });
    let stop = CancellationToken::new();
    let handle = tokio::spawn(c.run(notifier, stop.clone()));

    wait_for_reports(&sink, 20).await;
    stop.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(sink.count(), 20);
}

#[tokio::test(start_paused = true)]
async fn sync_timeout_starts_no_workers() {
    let sink = Arc::new(RecordingSink::default());
    let cfg = ControllerConfig { sync_timeout: Duration::from_secs(30), ..Default::default() };
    let c = controller(cfg, sink.clone());
    let queue = c.queue();
    // Live events arrive but the initial relist never does.
    let notifier = Arc::new(ScriptedNotifier { script: vec![Notification::Applied(selected_pod("pod-a"))] });
    let stop = CancellationToken::new();

    let err = c.run(notifier, stop.clone()).await.unwrap_err();
    assert!(matches!(err, ControllerError::SyncTimeout(d) if d == Duration::from_secs(30)), "{err:?}");
    assert_eq!(sink.count(), 0);
    assert!(queue.is_shutting_down());
    assert!(!stop.is_cancelled(), "caller's token is left alone");
}

#[tokio::test(start_paused = true)]
async fn notifier_failure_before_sync_is_reported() {
    let c = controller(ControllerConfig::default(), Arc::new(RecordingSink::default()));
    let err = c.run(Arc::new(FailingNotifier), CancellationToken::new()).await.unwrap_err();
    match err {
        ControllerError::Notifier(e) => assert!(e.to_string().contains("unreachable")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stop_before_sync_is_an_error() {
    let sink = Arc::new(RecordingSink::default());
    let c = controller(ControllerConfig::default(), sink.clone());
    let notifier = Arc::new(ScriptedNotifier { script: vec![] });
    let stop = CancellationToken::new();
    stop.cancel();

    let err = c.run(notifier, stop).await.unwrap_err();
    assert!(matches!(err, ControllerError::StoppedBeforeSync), "{err:?}");
    assert_eq!(sink.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_worker_is_replaced() {
    let sink = Arc::new(RecordingSink { fail_name: Some("bad".to_string()), ..Default::default() });
    let cfg = ControllerConfig { workers: 1, max_retries: 0, ..Default::default() };
    let limiter = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
    let c = Controller::new(cfg, limiter, sink.clone(), Arc::new(PanickingReporter));
    let queue = c.queue();
    let notifier = Arc::new(ScriptedNotifier {
        script: vec![
            Notification::Resynced(vec![selected_pod("bad")]),
            Notification::Applied(selected_pod("good")),
        ],
    });
    let stop = CancellationToken::new();
    let handle = tokio::spawn(c.run(notifier, stop.clone()));

    // "bad" is dropped on its first failure and the reporter panics inside the only worker.
    wait_for_reports(&sink, 2).await;
    assert_eq!(sink.names(), vec!["bad".to_string(), "good".to_string()]);
    assert!(!queue.is_processing(&ObjectKey::parse("ns/bad").unwrap()));

    stop.cancel();
    let res = tokio::time::timeout(Duration::from_secs(5), handle).await.expect("run did not return").unwrap();
    assert!(res.is_ok(), "{res:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifier_ending_after_sync_stops_the_controller() {
    let sink = Arc::new(RecordingSink::default());
    let c = controller(ControllerConfig::default(), sink.clone());
    let queue = c.queue();
    let notifier = Arc::new(ExitingNotifier { script: vec![Notification::Resynced(vec![selected_pod("pod-a")])], fail: false });
    let stop = CancellationToken::new();

    let res = tokio::time::timeout(Duration::from_secs(5), c.run(notifier, stop.clone())).await.expect("run did not return");
    assert!(matches!(res, Err(ControllerError::NotifierExited)), "{res:?}");
    assert!(queue.is_shutting_down());
    assert!(!stop.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifier_error_after_sync_is_returned() {
    let c = controller(ControllerConfig::default(), Arc::new(RecordingSink::default()));
    let notifier = Arc::new(ExitingNotifier { script: vec![Notification::Resynced(vec![])], fail: true });

    let res = tokio::time::timeout(Duration::from_secs(5), c.run(notifier, CancellationToken::new()))
        .await
        .expect("run did not return");
    match res {
        Err(ControllerError::Notifier(e)) => assert!(e.to_string().contains("watch stream broke")),
        other => panic!("unexpected {other:?}"),
    }
}
