//! Worker loop: claim a key, re-read the cache, report status, classify the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tracing::{debug, info, Instrument};
use vigil_core::{derive_status, LabelSelector, ObjectKey};
use vigil_queue::WorkQueue;
use vigil_sink::StatusSink;
use vigil_store::CacheReader;

use crate::report::ErrorReporter;
use crate::ReconcileError;

/// Releases a `get` claim when dropped, so every exit path calls `done`.
struct Claim<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: &'a ObjectKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) { self.queue.done(self.key); }
}

pub struct Reconciler {
    pub(crate) queue: Arc<WorkQueue<ObjectKey>>,
    pub(crate) cache: CacheReader,
    pub(crate) sink: Arc<dyn StatusSink>,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) selector: LabelSelector,
    pub(crate) id_label: String,
    pub(crate) max_retries: u32,
}

impl Reconciler {
    /// Process keys until the queue shuts down.
    pub async fn run_worker(self: Arc<Self>, id: usize) {
        async move {
            debug!("worker started");
            while self.process_next_item().await {}
            debug!("worker stopped");
        }
        .instrument(tracing::info_span!("worker", id))
        .await
    }

    /// Handle one key. Returns `false` once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        let claim = Claim { queue: &self.queue, key: &key };

        let started = Instant::now();
        let result = match AssertUnwindSafe(self.sync(&key)).catch_unwind().await {
            Ok(r) => r,
            Err(payload) => Err(ReconcileError::Panicked(panic_message(payload.as_ref()))),
        };
        histogram!("vigil_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);

        // Retry accounting happens under the claim, so no other worker holds this key meanwhile.
        self.handle_result(&key, result);
        drop(claim);
        true
    }

    /// Business logic for one key. Retry policy lives in `handle_result`.
    pub async fn sync(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let Some(pod) = self.cache.get(key) else {
            // Deleted objects get no status report.
            info!(%key, "pod does not exist anymore");
            counter!("vigil_reconcile_deleted_total", 1);
            return Ok(());
        };
        if !self.selector.matches(&pod) {
            return Ok(());
        }
        let Some(id) = pod.label(&self.id_label) else {
            debug!(%key, label = %self.id_label, "selected pod has no id label");
            return Ok(());
        };
        let status = derive_status(&pod.containers);
        info!(%key, %status, "container status");
        self.sink.report(&pod.name, id, status).await?;
        Ok(())
    }

    fn handle_result(&self, key: &ObjectKey, result: Result<(), ReconcileError>) {
        let err = match result {
            Ok(()) => {
                // Future failures must not inherit an old backoff.
                self.queue.forget(key);
                counter!("vigil_reconcile_total", 1, "outcome" => "success");
                return;
            }
            Err(e) => e,
        };

        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_retries {
            counter!("vigil_reconcile_total", 1, "outcome" => "retry");
            info!(%key, error = %err, attempt = requeues + 1, "error syncing pod; will retry");
            self.queue.add_rate_limited(key.clone());
            return;
        }

        counter!("vigil_reconcile_total", 1, "outcome" => "dropped");
        self.queue.forget(key);
        self.reporter.report(key, &err);
        info!(%key, error = %err, "dropping pod out of the queue");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
