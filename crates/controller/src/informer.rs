//! Applies notifications to the cache and enqueues the affected keys.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{Notification, ObjectKey};
use vigil_queue::WorkQueue;
use vigil_store::CacheWriter;

/// Reports whether the first full relist has been applied to the cache.
#[derive(Clone)]
pub struct SyncHandle {
    rx: watch::Receiver<bool>,
}

impl SyncHandle {
    pub fn has_synced(&self) -> bool { *self.rx.borrow() }

    /// Resolves `true` once synced, `false` if the informer went away first.
    pub async fn wait(&mut self) -> bool { self.rx.wait_for(|synced| *synced).await.is_ok() }
}

/// Sole writer of the object cache.
pub struct Informer {
    writer: CacheWriter,
    queue: Arc<WorkQueue<ObjectKey>>,
    synced: watch::Sender<bool>,
}

impl Informer {
    pub fn new(writer: CacheWriter, queue: Arc<WorkQueue<ObjectKey>>) -> (Self, SyncHandle) {
        let (synced, rx) = watch::channel(false);
        (Self { writer, queue, synced }, SyncHandle { rx })
    }

    /// Write first, then enqueue: a worker never reads a snapshot older than its trigger.
    pub fn handle(&mut self, notification: Notification) {
        match notification {
            Notification::Applied(snap) => {
                let key = match snap.key() {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(error = %e, "dropping applied object without a key");
                        return;
                    }
                };
                let uid = snap.uid;
                if let Some(prev) = self.writer.put(key.clone(), snap) {
                    if prev.uid.is_some() && uid.is_some() && prev.uid != uid {
                        debug!(%key, "object recreated under the same name");
                    }
                }
                self.queue.add(key);
            }
            Notification::Deleted(key) => {
                if self.writer.delete(&key).is_none() {
                    debug!(%key, "delete for object not in cache");
                }
                self.queue.add(key);
            }
            Notification::Resynced(items) => {
                let listed: Vec<ObjectKey> = items.iter().filter_map(|i| i.key().ok()).collect();
                let stale = self.writer.replace(items);
                info!(listed = listed.len(), stale = stale.len(), "cache resynced");
                for key in listed.into_iter().chain(stale) {
                    self.queue.add(key);
                }
                self.synced.send_replace(true);
            }
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Notification>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(n) => self.handle(n),
                    None => {
                        debug!("notification channel closed; exiting informer loop");
                        break;
                    }
                },
            }
        }
        info!("informer stopped");
    }
}
