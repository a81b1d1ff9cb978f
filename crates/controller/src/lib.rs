//! Vigil controller: wires the notifier, informer, work queue and worker pool together.
//!
//! Lifecycle of [`Controller::run`]:
//! 1. start the notifier and the informer;
//! 2. wait until the first relist is in the cache (or give up after `sync_timeout`);
//! 3. start `workers` reconcilers;
//! 4. replace workers that panic; treat an exiting notifier as fatal;
//! 5. on stop, shut the queue down and wait for workers to finish what they hold.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use metrics::counter;
use tracing::{debug, error, info, warn};
use vigil_core::{LabelSelector, ObjectKey};
use vigil_kubehub::ChangeNotifier;
use vigil_queue::{RateLimiter, WorkQueue};
use vigil_sink::{SinkError, StatusSink};
use vigil_store::{object_cache, CacheReader, CacheWriter};

mod informer;
mod reconciler;
mod report;

pub use informer::{Informer, SyncHandle};
pub use reconciler::Reconciler;
pub use report::{ErrorReporter, LogErrorReporter};

/// Failure of a single reconciliation attempt. Always retryable.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out waiting for caches to sync after {0:?}")]
    SyncTimeout(Duration),
    #[error("stopped before caches synced")]
    StoppedBeforeSync,
    #[error("change notifier failed: {0}")]
    Notifier(#[source] anyhow::Error),
    /// The notifier returned after sync while the controller was still running.
    #[error("change notifier stopped unexpectedly")]
    NotifierExited,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Failures tolerated per key before it is dropped.
    pub max_retries: u32,
    pub sync_timeout: Duration,
    /// Capacity of the notifier → informer channel.
    pub channel_cap: usize,
    /// Only pods matching this label get a status report.
    pub selector: LabelSelector,
    /// Label whose value is sent as the report id.
    pub id_label: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 5,
            sync_timeout: Duration::from_secs(120),
            channel_cap: 1024,
            selector: LabelSelector::new("status-controller-vcluster", "cluster-manager"),
            id_label: "status-controller".to_string(),
        }
    }
}

pub struct Controller {
    cfg: ControllerConfig,
    queue: Arc<WorkQueue<ObjectKey>>,
    writer: CacheWriter,
    reconciler: Arc<Reconciler>,
}

impl Controller {
    pub fn new(
        cfg: ControllerConfig,
        limiter: impl RateLimiter<ObjectKey> + 'static,
        sink: Arc<dyn StatusSink>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(limiter));
        let (writer, cache) = object_cache();
        let reconciler = Arc::new(Reconciler {
            queue: Arc::clone(&queue),
            cache,
            sink,
            reporter,
            selector: cfg.selector.clone(),
            id_label: cfg.id_label.clone(),
            max_retries: cfg.max_retries,
        });
        Self { cfg, queue, writer, reconciler }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> { Arc::clone(&self.queue) }

    pub fn cache(&self) -> CacheReader { self.writer.reader() }

    pub fn reconciler(&self) -> Arc<Reconciler> { Arc::clone(&self.reconciler) }

    /// Split off the informer for driving notifications by hand.
    pub fn into_parts(self) -> (Informer, SyncHandle, Arc<Reconciler>) {
        let (informer, synced) = Informer::new(self.writer, self.queue);
        (informer, synced, self.reconciler)
    }

    /// Run until `stop` fires. Fails without starting workers if the cache never syncs, and
    /// fails after draining the workers if the notifier stops on its own.
    pub async fn run(self, notifier: Arc<dyn ChangeNotifier>, stop: CancellationToken) -> Result<(), ControllerError> {
        let cfg = self.cfg.clone();
        let queue = Arc::clone(&self.queue);
        let (informer, mut synced, reconciler) = self.into_parts();
        info!(workers = cfg.workers, max_retries = cfg.max_retries, "starting pod controller");

        // Child token: a failed sync stops our tasks without cancelling the caller's token.
        let inner = stop.child_token();
        let (tx, rx) = mpsc::channel(cfg.channel_cap.max(1));
        let informer_task = tokio::spawn(informer.run(rx, inner.clone()));
        let notifier_task = tokio::spawn({
            let inner = inner.clone();
            async move { notifier.run(tx, inner).await }
        });

        let outcome = tokio::select! {
            ok = synced.wait() => {
                if ok { Ok(()) } else { Err(ControllerError::StoppedBeforeSync) }
            }
            _ = tokio::time::sleep(cfg.sync_timeout) => Err(ControllerError::SyncTimeout(cfg.sync_timeout)),
            _ = stop.cancelled() => Err(ControllerError::StoppedBeforeSync),
        };
        if let Err(e) = outcome {
            inner.cancel();
            queue.shut_down();
            let _ = informer_task.await;
            let err = match notifier_task.await {
                Ok(Err(notifier_err)) => ControllerError::Notifier(notifier_err),
                _ => e,
            };
            error!(error = %err, "controller not started");
            return Err(err);
        }

        info!("caches synced; starting workers");
        let mut workers = JoinSet::new();
        let mut next_id = 0;
        for _ in 0..cfg.workers.max(1) {
            workers.spawn(Arc::clone(&reconciler).run_worker(next_id));
            next_id += 1;
        }

        // Supervise until stopped: replace crashed workers, stop if the notifier goes away.
        let mut notifier_task = notifier_task;
        let notifier_exit = loop {
            tokio::select! {
                _ = inner.cancelled() => break None,
                res = &mut notifier_task => break Some(res),
                Some(res) = workers.join_next() => match res {
                    Err(e) if e.is_panic() => {
                        counter!("vigil_worker_restarts_total", 1);
                        error!(error = %e, worker = next_id, "worker panicked; starting a replacement");
                        workers.spawn(Arc::clone(&reconciler).run_worker(next_id));
                        next_id += 1;
                    }
                    Err(e) => warn!(error = %e, "worker task cancelled"),
                    Ok(()) => debug!("worker exited"),
                },
            }
        };
        // A notifier finishing because we were stopped is not a failure.
        let unexpected_exit = notifier_exit.is_some() && !inner.is_cancelled();

        info!("stopping pod controller");
        inner.cancel();
        queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        let _ = informer_task.await;
        let notifier_res = match notifier_exit {
            Some(res) => res,
            None => notifier_task.await,
        };
        if unexpected_exit {
            let err = match notifier_res {
                Ok(Ok(())) => ControllerError::NotifierExited,
                Ok(Err(e)) => ControllerError::Notifier(e),
                Err(e) => ControllerError::Notifier(anyhow::anyhow!("change notifier task failed: {e}")),
            };
            error!(error = %err, "pod controller stopped: notifications lost");
            return Err(err);
        }
        match notifier_res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "change notifier exited with error"),
            Err(e) => warn!(error = %e, "change notifier task failed"),
        }
        info!("pod controller stopped");
        Ok(())
    }
}
