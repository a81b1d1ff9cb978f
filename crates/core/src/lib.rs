//! Vigil core types: object keys, pod snapshots and the notifications that carry them.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod status;

pub use status::{derive_status, DerivedStatus};

pub type Uid = [u8; 16];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("object metadata has no name")]
    MissingName,
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),
    #[error("invalid label selector: {0:?} (expect key=value)")]
    InvalidSelector(String),
}

/// Identity of a watched object: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Result<Self, CoreError> {
        if name.is_empty() { return Err(CoreError::MissingName); }
        match namespace {
            Some(ns) if !ns.is_empty() => Ok(Self(format!("{}/{}", ns, name))),
            _ => Ok(Self(name.to_string())),
        }
    }

    /// Parse a rendered key. At most one `/` is allowed and neither side may be empty.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let mut parts = raw.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self(raw.to_string())),
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(CoreError::InvalidKey(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split into `(namespace, name)`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }

    pub fn name(&self) -> &str { self.split().1 }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Observed state of a single container, reduced to what status derivation needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Waiting { reason: Option<String> },
    Running,
    Terminated { exit_code: i32, reason: Option<String> },
    /// The container status carried no state at all.
    Unknown,
}

/// Latest known state of a pod as reported by the watch source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub uid: Option<Uid>,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// One entry per `status.containerStatuses` item, in API order.
    pub containers: SmallVec<[ContainerState; 2]>,
}

impl PodSnapshot {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            uid: None,
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            resource_version: None,
            labels: SmallVec::new(),
            containers: SmallVec::new(),
        }
    }

    pub fn key(&self) -> Result<ObjectKey, CoreError> {
        ObjectKey::new(self.namespace.as_deref(), &self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.retain(|(k, _)| k != key);
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_container(mut self, state: ContainerState) -> Self {
        self.containers.push(state);
        self
    }
}

/// A change reported by the watch source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Notification {
    /// Object added or updated.
    Applied(PodSnapshot),
    /// Object deleted. Carries only the key; the final state may be unknown.
    Deleted(ObjectKey),
    /// Full relist. Replaces the cache content and marks it synced.
    Resynced(Vec<PodSnapshot>),
}

/// Label predicate `key=value` selecting which objects get a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: &str, value: &str) -> Self { Self { key: key.to_string(), value: value.to_string() } }

    pub fn matches(&self, pod: &PodSnapshot) -> bool { pod.label(&self.key) == Some(self.value.as_str()) }
}

impl std::str::FromStr for LabelSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok(Self::new(k.trim(), v.trim())),
            _ => Err(CoreError::InvalidSelector(s.to_string())),
        }
    }
}

pub mod prelude {
    pub use super::{ContainerState, DerivedStatus, LabelSelector, Notification, ObjectKey, PodSnapshot, Uid};
}
