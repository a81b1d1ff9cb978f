//! Vigil kubehub – pod/node watchers and conversion into core notifications

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Node, Pod};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::{ContainerState, Notification, ObjectKey, PodSnapshot, Uid};

/// Source of object change notifications.
///
/// `run` pushes notifications into `tx` until `stop` fires or the receiver goes away.
/// The first full list must be sent as [`Notification::Resynced`]; the consumer treats
/// that as the initial sync.
#[async_trait::async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn run(&self, tx: mpsc::Sender<Notification>, stop: CancellationToken) -> Result<()>;
}

/// Pod watcher backed by `kube::runtime::watcher` with the default backoff.
pub struct KubePodNotifier {
    client: Client,
    namespace: Option<String>,
}

impl KubePodNotifier {
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }

    fn api(&self) -> Api<Pod> {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ChangeNotifier for KubePodNotifier {
    async fn run(&self, tx: mpsc::Sender<Notification>, stop: CancellationToken) -> Result<()> {
        let stream = watcher::watcher(self.api(), watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(ns = ?self.namespace, "pod watcher started");
        loop {
            let ev = tokio::select! {
                _ = stop.cancelled() => break,
                ev = stream.next() => ev,
            };
            let Some(ev) = ev else {
                warn!("pod watch stream ended");
                break;
            };
            let notification = match ev {
                Ok(ev) => match notification_from(ev) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "skipping pod event");
                        continue;
                    }
                },
                Err(e) => {
                    // default_backoff() delays the next poll; the watcher relists on its own.
                    counter!("vigil_watch_errors_total", 1, "kind" => "pod");
                    warn!(error = %e, "pod watch error");
                    continue;
                }
            };
            if tx.send(notification).await.is_err() {
                debug!("notification receiver dropped; stopping pod watcher");
                break;
            }
        }
        info!("pod watcher stopped");
        Ok(())
    }
}

/// Translate one watcher event. Deletes keep only the key so a final delivery can still be made.
pub fn notification_from(ev: Event<Pod>) -> Result<Notification> {
    match ev {
        Event::Applied(pod) => Ok(Notification::Applied(pod_snapshot(&pod)?)),
        Event::Deleted(pod) => Ok(Notification::Deleted(deleted_key(&pod)?)),
        Event::Restarted(pods) => {
            debug!(count = pods.len(), "watch restart");
            let mut items = Vec::with_capacity(pods.len());
            for pod in &pods {
                match pod_snapshot(pod) {
                    Ok(s) => items.push(s),
                    Err(e) => warn!(error = %e, "skipping relisted pod"),
                }
            }
            Ok(Notification::Resynced(items))
        }
    }
}

fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Key for a deleted pod: taken from the final known metadata, which always carries the name.
pub fn deleted_key(pod: &Pod) -> Result<ObjectKey> {
    let name = pod.metadata.name.as_deref().ok_or_else(|| anyhow!("deleted pod missing metadata.name"))?;
    Ok(ObjectKey::new(pod.metadata.namespace.as_deref(), name)?)
}

pub fn pod_snapshot(pod: &Pod) -> Result<PodSnapshot> {
    let meta = &pod.metadata;
    let name = meta.name.as_deref().ok_or_else(|| anyhow!("pod missing metadata.name"))?;
    let mut snap = PodSnapshot::new(meta.namespace.as_deref(), name);
    snap.uid = meta.uid.as_deref().and_then(|u| to_uid(u).ok());
    snap.resource_version = meta.resource_version.clone();
    if let Some(labels) = &meta.labels {
        snap.labels = labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        snap.containers = statuses.iter().map(container_state).collect();
    }
    Ok(snap)
}

pub fn container_state(cs: &ContainerStatus) -> ContainerState {
    let Some(state) = cs.state.as_ref() else { return ContainerState::Unknown };
    if let Some(w) = &state.waiting {
        ContainerState::Waiting { reason: w.reason.clone() }
    } else if state.running.is_some() {
        ContainerState::Running
    } else if let Some(t) = &state.terminated {
        ContainerState::Terminated { exit_code: t.exit_code, reason: t.reason.clone() }
    } else {
        ContainerState::Unknown
    }
}

/// `Ready`, `NotReady` or `Unknown` from the node's `Ready` condition.
pub fn node_condition(node: &Node) -> &'static str {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_ref());
    for c in conditions.into_iter().flatten() {
        if c.type_ == "Ready" {
            return if c.status == "True" { "Ready" } else { "NotReady" };
        }
    }
    "Unknown"
}

fn record_node(node: &Node, verb: &str) {
    let name = node.metadata.name.clone().unwrap_or_default();
    let cond = node_condition(node);
    gauge!("vigil_node_ready", if cond == "Ready" { 1.0 } else { 0.0 }, "node" => name.clone());
    info!(node = %name, status = cond, "node {}", verb);
}

/// Watch nodes and log their readiness. Informational only; nothing is enqueued.
pub async fn watch_nodes(client: Client, stop: CancellationToken) -> Result<()> {
    let api: Api<Node> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("node watcher started");
    loop {
        let ev = tokio::select! {
            _ = stop.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            None => {
                warn!("node watch stream ended");
                break;
            }
            Some(Ok(Event::Applied(node))) => record_node(&node, "updated"),
            Some(Ok(Event::Deleted(node))) => {
                let name = node.metadata.name.clone().unwrap_or_default();
                gauge!("vigil_node_ready", 0.0, "node" => name.clone());
                info!(node = %name, "node deleted");
            }
            Some(Ok(Event::Restarted(nodes))) => {
                for node in &nodes { record_node(node, "listed"); }
            }
            Some(Err(e)) => {
                counter!("vigil_watch_errors_total", 1, "kind" => "node");
                warn!(error = %e, "node watch error");
            }
        }
    }
    info!("node watcher stopped");
    Ok(())
}
