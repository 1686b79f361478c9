use std::time::{Duration, SystemTime};

use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::{
    api::{Api, ListParams, LogParams},
    runtime::{watcher, WatchStreamExt},
};

use crate::{
    container::Container,
    error::{Error, Result},
    kubernetes::labels,
    state::ContainerState,
};

/// Blocks until exactly one pod carries the handle's instance label,
/// within `budget`. More than one match is a hard error, the one-pod-per-
/// handle rule is load bearing for exec and file transfer.
pub(crate) async fn await_single_pod(
    pods: &Api<Pod>,
    container: &Container,
    budget: Duration,
) -> Result<Pod> {
    let selector = labels::instance_selector(container.instance_id());
    let params = ListParams::default().labels(&selector);
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let listed = pods.list(&params).await.map_err(Error::from)?;
        match listed.items.len() {
            0 => {}
            1 => {
                if let Some(pod) = listed.items.into_iter().next() {
                    if pod.metadata.name.is_some() {
                        return Ok(pod);
                    }
                }
            }
            n => {
                return Err(Error::Backend(format!(
                    "{n} pods match instance {}, expected exactly one",
                    container.instance_id()
                )))
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(budget));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// One watcher task per handle: translates pod events into state
/// transitions until cancelled. Illegal transitions are dropped by the
/// state cell itself.
pub(crate) fn spawn_pod_watcher(client: kube::Client, container: Container, task_mode: bool) {
    let cancel = container.cancel_token();
    tokio::spawn(async move {
        let namespace = container.spec().namespace.to_string();
        let pods: Api<Pod> = Api::namespaced(client, &namespace);
        let selector = labels::instance_selector(container.instance_id());
        let events = watcher(
            pods,
            watcher::Config::default().labels(&selector),
        )
        .applied_objects();
        futures::pin_mut!(events);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(container.name = %container.spec().name, "pod watcher cancelled");
                    return;
                }
                event = events.next() => match event {
                    Some(Ok(pod)) => apply_pod_event(&container, &pod, task_mode),
                    Some(Err(err)) => {
                        // the watcher backs off and re-lists by itself
                        tracing::warn!(container.name = %container.spec().name, "pod watch error: {err}");
                    }
                    None => {
                        if !container.state().is_completed() {
                            tracing::warn!(
                                container.name = %container.spec().name,
                                "pod watch ended unexpectedly"
                            );
                            container.transition(ContainerState::Failed);
                        }
                        return;
                    }
                }
            }
        }
    });
}

/// Maps one observed pod onto the handle: identity fields first, then the
/// terminated-container override, then the plain phase mapping.
pub(crate) fn apply_pod_event(container: &Container, pod: &Pod, task_mode: bool) {
    if let Some(name) = &pod.metadata.name {
        container.set_pod_name(name.clone());
        container.set_host(name.clone());
    }
    let status = match &pod.status {
        Some(status) => status,
        None => return,
    };
    if let Some(ip) = status.pod_ip.as_deref().and_then(|ip| ip.parse().ok()) {
        container.set_ip_address(ip);
    }

    let main_status = status.container_statuses.as_ref().and_then(|statuses| {
        statuses
            .iter()
            .find(|s| s.name == container.spec().name.as_str())
            .or_else(|| statuses.first())
    });
    if let Some(main) = main_status {
        if apply_terminated_override(container, main, task_mode) {
            return;
        }
        if let Some(waiting) = main.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            if let Some(reason) = waiting.reason.as_deref() {
                if matches!(
                    reason,
                    "ErrImagePull" | "ImagePullBackOff" | "InvalidImageName" | "CreateContainerError"
                ) {
                    tracing::warn!(
                        container.name = %container.spec().name,
                        reason,
                        "container cannot start"
                    );
                    container.transition(ContainerState::Failed);
                    return;
                }
            }
        }
    }

    match status.phase.as_deref() {
        Some("Pending") => {
            container.transition(ContainerState::Initializing);
        }
        Some("Running") => {
            container.mark_started();
            container.transition(ContainerState::Running);
        }
        Some("Succeeded") => {
            ensure_running_passage(container);
            container.transition(ContainerState::Stopped);
        }
        Some("Failed") => {
            container.transition(ContainerState::Failed);
        }
        Some("Unknown") => {
            container.transition(ContainerState::Unknown);
        }
        _ => {}
    }
}

/// A terminated container status carries the authoritative exit code and
/// finish time. Task workloads complete into `Stopped` whatever the exit
/// code was; service workloads treat an error reason as failure.
fn apply_terminated_override(
    container: &Container,
    status: &ContainerStatus,
    task_mode: bool,
) -> bool {
    let terminated = match status.state.as_ref().and_then(|s| s.terminated.as_ref()) {
        Some(terminated) => terminated,
        None => return false,
    };
    container.set_exit_code(i64::from(terminated.exit_code));
    if let Some(started) = &terminated.started_at {
        container.set_started_at(SystemTime::from(started.0));
    }
    if let Some(finished) = &terminated.finished_at {
        container.set_finished_at(SystemTime::from(finished.0));
    }

    let errored = terminated
        .reason
        .as_deref()
        .is_some_and(|reason| reason.to_ascii_lowercase().contains("error"));
    ensure_running_passage(container);
    if !task_mode && errored {
        container.transition(ContainerState::Failed);
    } else {
        container.transition(ContainerState::Stopped);
    }
    true
}

/// Fast workloads can terminate before the watcher ever observes the
/// `Running` phase; the missed observation is synthesized so the
/// transition graph stays intact.
fn ensure_running_passage(container: &Container) {
    if matches!(
        container.state(),
        ContainerState::Initializing | ContainerState::Uninitiated
    ) {
        container.transition(ContainerState::Initializing);
        container.mark_started();
        container.transition(ContainerState::Running);
    }
}

/// One streamer task per handle: follows the pod log and hands each line
/// to the output callback in arrival order.
pub(crate) fn spawn_log_streamer(client: kube::Client, container: Container, pod_name: String) {
    let cancel = container.cancel_token();
    tokio::spawn(async move {
        let namespace = container.spec().namespace.to_string();
        let pods: Api<Pod> = Api::namespaced(client, &namespace);
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let reader = match pods.log_stream(&pod_name, &params).await {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(pod = %pod_name, "opening log stream failed: {err}");
                return;
            }
        };
        let mut lines = reader.lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(pod = %pod_name, "log streamer cancelled");
                    return;
                }
                line = lines.try_next() => match line {
                    Ok(Some(line)) => container.spec().emit_line(&line),
                    // the stream closes when the pod exits
                    Ok(None) => return,
                    Err(err) => {
                        tracing::debug!(pod = %pod_name, "log stream closed: {err}");
                        return;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{ContainerState as K8sContainerState, ContainerStateTerminated, PodStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    fn handle(task: bool) -> Container {
        let mut builder = crate::spec::ContainerSpec::builder()
            .platform(crate::spec::Platform::Kubernetes)
            .name("api")
            .unwrap()
            .image("busybox")
            .unwrap();
        if task {
            builder = builder.mode(crate::spec::ExecutionMode::Task);
        }
        Container::new(builder.build().unwrap())
    }

    fn pod(phase: &str) -> Pod {
        Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("api-abc12".to_owned()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_owned()),
                pod_ip: Some("10.1.2.3".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated_pod(exit_code: i32, reason: &str) -> Pod {
        let mut pod = pod("Failed");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "api".to_owned(),
            state: Some(K8sContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    reason: Some(reason.to_owned()),
                    finished_at: Some(Time(chrono::Utc::now())),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    #[test]
    fn phases_map_to_states() {
        let container = handle(false);
        container.transition(ContainerState::Initializing);

        apply_pod_event(&container, &pod("Pending"), false);
        assert_eq!(container.state(), ContainerState::Initializing);

        apply_pod_event(&container, &pod("Running"), false);
        assert_eq!(container.state(), ContainerState::Running);
        assert_eq!(container.pod_name(), Some("api-abc12"));
        assert_eq!(
            container.ip_address().unwrap().to_string(),
            "10.1.2.3"
        );

        apply_pod_event(&container, &pod("Unknown"), false);
        assert_eq!(container.state(), ContainerState::Unknown);

        apply_pod_event(&container, &pod("Running"), false);
        assert_eq!(container.state(), ContainerState::Running);
    }

    #[test]
    fn task_termination_stops_with_exit_code() {
        let container = handle(true);
        container.transition(ContainerState::Initializing);
        container.transition(ContainerState::Running);

        apply_pod_event(&container, &terminated_pod(7, "Error"), true);
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.exit_code(), Some(7));
        assert!(container.finished_at().is_some());
    }

    #[test]
    fn service_error_termination_fails() {
        let container = handle(false);
        container.transition(ContainerState::Initializing);
        container.transition(ContainerState::Running);

        apply_pod_event(&container, &terminated_pod(1, "Error"), false);
        assert_eq!(container.state(), ContainerState::Failed);
        assert_eq!(container.exit_code(), Some(1));
    }

    #[test]
    fn clean_termination_stops_service() {
        let container = handle(false);
        container.transition(ContainerState::Initializing);
        container.transition(ContainerState::Running);

        apply_pod_event(&container, &terminated_pod(0, "Completed"), false);
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.exit_code(), Some(0));
    }

    #[test]
    fn fast_completion_synthesizes_running_passage() {
        let container = handle(true);
        container.transition(ContainerState::Initializing);

        // terminated before Running was ever observed
        apply_pod_event(&container, &terminated_pod(0, "Completed"), true);
        assert_eq!(container.state(), ContainerState::Stopped);
        assert!(container.started_at().is_some());
    }

    #[test]
    fn image_pull_failure_fails_the_container() {
        let container = handle(false);
        container.transition(ContainerState::Initializing);

        let mut pod = pod("Pending");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "api".to_owned(),
            state: Some(K8sContainerState {
                waiting: Some(k8s_openapi::api::core::v1::ContainerStateWaiting {
                    reason: Some("ImagePullBackOff".to_owned()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        apply_pod_event(&container, &pod, false);
        assert_eq!(container.state(), ContainerState::Failed);
    }
}
