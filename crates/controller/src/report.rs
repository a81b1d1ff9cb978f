use metrics::counter;
use tracing::error;
use vigil_core::ObjectKey;

use crate::ReconcileError;

/// Process-wide sink for keys that exhausted their retries. Must not fail or block.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, key: &ObjectKey, err: &ReconcileError);
}

#[derive(Debug, Default)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, key: &ObjectKey, err: &ReconcileError) {
        counter!("vigil_reconcile_dropped_total", 1);
        error!(%key, error = %err, "giving up on key after retries");
    }
}
