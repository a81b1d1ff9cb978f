#![forbid(unsafe_code)]

use vigil_core::{derive_status, ContainerState, DerivedStatus, LabelSelector, ObjectKey, PodSnapshot};

fn waiting(reason: &str) -> ContainerState { ContainerState::Waiting { reason: Some(reason.to_string()) } }

#[test]
fn single_container_states() {
    assert_eq!(derive_status(&[ContainerState::Running]), DerivedStatus::Running);
    assert_eq!(derive_status(&[waiting("ContainerCreating")]), DerivedStatus::Pending);
    assert_eq!(derive_status(&[ContainerState::Waiting { reason: None }]), DerivedStatus::Pending);
    assert_eq!(derive_status(&[ContainerState::Terminated { exit_code: 0, reason: Some("Completed".into()) }]), DerivedStatus::Stopped);
    assert_eq!(derive_status(&[ContainerState::Unknown]), DerivedStatus::Failed);
}

#[test]
fn waiting_reasons_are_surfaced() {
    for (reason, want) in [
        ("CrashLoopBackOff", DerivedStatus::CrashLoopBackOff),
        ("ImagePullBackOff", DerivedStatus::ImagePullBackOff),
        ("OOMKilled", DerivedStatus::OomKilled),
        ("ContainerConfigError", DerivedStatus::ContainerConfigError),
    ] {
        let got = derive_status(&[waiting(reason)]);
        assert_eq!(got, want);
        assert_eq!(got.as_str(), reason);
    }
}

#[test]
fn oom_kill_on_terminated_container() {
    let st = ContainerState::Terminated { exit_code: 137, reason: Some("OOMKilled".into()) };
    assert_eq!(derive_status(&[st]), DerivedStatus::OomKilled);
}

#[test]
fn least_healthy_container_wins() {
    let containers = [ContainerState::Running, waiting("CrashLoopBackOff"), ContainerState::Running];
    assert_eq!(derive_status(&containers), DerivedStatus::CrashLoopBackOff);

    let containers = [ContainerState::Terminated { exit_code: 0, reason: None }, ContainerState::Running];
    assert_eq!(derive_status(&containers), DerivedStatus::Stopped);
}

#[test]
fn no_containers_is_pending() {
    assert_eq!(derive_status(&[]), DerivedStatus::Pending);
}

#[test]
fn status_serializes_as_plain_string() {
    assert_eq!(serde_json::to_string(&DerivedStatus::OomKilled).unwrap(), "\"OOMKilled\"");
    assert_eq!(serde_json::to_string(&DerivedStatus::Running).unwrap(), "\"Running\"");
}

#[test]
fn object_keys() {
    let k = ObjectKey::new(Some("ns"), "pod-a").unwrap();
    assert_eq!(k.as_str(), "ns/pod-a");
    assert_eq!(k.split(), (Some("ns"), "pod-a"));
    assert_eq!(k.name(), "pod-a");

    let cluster = ObjectKey::new(None, "node-1").unwrap();
    assert_eq!(cluster.split(), (None, "node-1"));

    assert!(ObjectKey::new(Some("ns"), "").is_err());
    assert_eq!(ObjectKey::parse("ns/pod-a").unwrap(), k);
    assert!(ObjectKey::parse("a/b/c").is_err());
    assert!(ObjectKey::parse("/x").is_err());
    assert!(ObjectKey::parse("").is_err());
}

#[test]
fn label_selector_matching() {
    let sel: LabelSelector = "status-controller-vcluster=cluster-manager".parse().unwrap();
    let pod = PodSnapshot::new(Some("ns"), "pod-a").with_label("status-controller-vcluster", "cluster-manager");
    assert!(sel.matches(&pod));
    let other = PodSnapshot::new(Some("ns"), "pod-b").with_label("status-controller-vcluster", "other");
    assert!(!sel.matches(&other));
    assert!("no-equals".parse::<LabelSelector>().is_err());
}
