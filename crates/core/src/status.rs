//! Status derivation from container states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ContainerState;

/// Status string reported for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerivedStatus {
    Running,
    Pending,
    Stopped,
    Failed,
    CrashLoopBackOff,
    ImagePullBackOff,
    #[serde(rename = "OOMKilled")]
    OomKilled,
    ContainerConfigError,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Running => "Running",
            DerivedStatus::Pending => "Pending",
            DerivedStatus::Stopped => "Stopped",
            DerivedStatus::Failed => "Failed",
            DerivedStatus::CrashLoopBackOff => "CrashLoopBackOff",
            DerivedStatus::ImagePullBackOff => "ImagePullBackOff",
            DerivedStatus::OomKilled => "OOMKilled",
            DerivedStatus::ContainerConfigError => "ContainerConfigError",
        }
    }

    /// Waiting/terminated reasons that are surfaced verbatim.
    fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "CrashLoopBackOff" => Some(DerivedStatus::CrashLoopBackOff),
            "ImagePullBackOff" => Some(DerivedStatus::ImagePullBackOff),
            "OOMKilled" => Some(DerivedStatus::OomKilled),
            "ContainerConfigError" => Some(DerivedStatus::ContainerConfigError),
            _ => None,
        }
    }

    pub fn from_container(state: &ContainerState) -> Self {
        match state {
            ContainerState::Waiting { reason } => reason
                .as_deref()
                .and_then(Self::from_reason)
                .unwrap_or(DerivedStatus::Pending),
            ContainerState::Running => DerivedStatus::Running,
            ContainerState::Terminated { reason, .. } => match reason.as_deref() {
                Some("OOMKilled") => DerivedStatus::OomKilled,
                _ => DerivedStatus::Stopped,
            },
            ContainerState::Unknown => DerivedStatus::Failed,
        }
    }

    // Higher wins when a pod has several containers.
    fn severity(&self) -> u8 {
        match self {
            DerivedStatus::Running => 0,
            DerivedStatus::Stopped => 1,
            DerivedStatus::Pending => 2,
            DerivedStatus::Failed => 3,
            DerivedStatus::CrashLoopBackOff
            | DerivedStatus::ImagePullBackOff
            | DerivedStatus::OomKilled
            | DerivedStatus::ContainerConfigError => 4,
        }
    }
}

impl fmt::Display for DerivedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Derive a pod status from its container states: the least healthy container decides,
/// ties go to the first container in API order. A pod without container statuses is `Pending`.
pub fn derive_status(containers: &[ContainerState]) -> DerivedStatus {
    let mut out: Option<DerivedStatus> = None;
    for c in containers {
        let s = DerivedStatus::from_container(c);
        match out {
            Some(cur) if cur.severity() >= s.severity() => {}
            _ => out = Some(s),
        }
    }
    out.unwrap_or(DerivedStatus::Pending)
}
