use std::{
    net::IpAddr,
    sync::{Arc, OnceLock},
    time::{Duration, SystemTime},
};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    spec::ContainerSpec,
    state::{ContainerState, StateCell},
};

/// The library-facing handle for one container workload across its
/// lifetime.
///
/// The handle is a passive record: it carries the spec, the state cell and
/// the backend identifiers, and is mutated only by the owning runtime.
/// Cloning is cheap and shares the same workload. A handle is single-use;
/// once it reaches `Deleted` it must not be started again.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

struct Inner {
    spec: ContainerSpec,
    // uniquely selects the backing pod via the instance label
    instance_id: Uuid,
    state: StateCell,
    // single-assignment cells, first write wins
    backend_id: OnceLock<String>,
    pod_name: OnceLock<String>,
    network_name: OnceLock<String>,
    ip_address: OnceLock<IpAddr>,
    host: OnceLock<String>,
    started_at: OnceLock<SystemTime>,
    finished_at: OnceLock<SystemTime>,
    exit_code: OnceLock<i64>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.inner.spec.name)
            .field("instance_id", &self.inner.instance_id)
            .field("state", &self.state())
            .field("backend_id", &self.inner.backend_id.get())
            .field("pod_name", &self.inner.pod_name.get())
            .field("ip_address", &self.inner.ip_address.get())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Wraps a spec in a fresh handle in state `Uninitiated`.
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            inner: Arc::new(Inner {
                spec,
                instance_id: Uuid::new_v4(),
                state: StateCell::new(),
                backend_id: OnceLock::new(),
                pod_name: OnceLock::new(),
                network_name: OnceLock::new(),
                ip_address: OnceLock::new(),
                host: OnceLock::new(),
                started_at: OnceLock::new(),
                finished_at: OnceLock::new(),
                exit_code: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ContainerState {
        self.inner.state.get()
    }

    /// Blocks until the container reaches `state`. Returns `false` on
    /// timeout; a `None` timeout waits indefinitely.
    pub async fn wait_for_state(
        &self,
        state: ContainerState,
        timeout: Option<Duration>,
    ) -> bool {
        self.inner.state.wait_for(state, timeout).await
    }

    /// The daemon container id or the Kubernetes workload resource name.
    pub fn backend_id(&self) -> Option<&str> {
        self.inner.backend_id.get().map(String::as_str)
    }

    pub fn pod_name(&self) -> Option<&str> {
        self.inner.pod_name.get().map(String::as_str)
    }

    pub fn ip_address(&self) -> Option<IpAddr> {
        self.inner.ip_address.get().copied()
    }

    pub fn host(&self) -> Option<&str> {
        self.inner.host.get().map(String::as_str)
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.inner.started_at.get().copied()
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.inner.finished_at.get().copied()
    }

    /// Exit code of the main process, present once the backend reported a
    /// completed container.
    pub fn exit_code(&self) -> Option<i64> {
        self.inner.exit_code.get().copied()
    }

    /// Finish minus start while completed, now minus start while live.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at()?;
        let end = self.finished_at().unwrap_or_else(SystemTime::now);
        end.duration_since(started).ok()
    }

    /// The value of the pod instance label uniquely selecting the backing
    /// pod on Kubernetes.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    // ---- runtime-side mutation ----

    pub(crate) fn transition(&self, next: ContainerState) -> bool {
        self.inner.state.transition(next)
    }

    /// Waits until the workload has completed (stopped, failed or deleted).
    pub(crate) async fn wait_until_completed(&self, timeout: Option<Duration>) -> bool {
        self.inner
            .state
            .wait_until(ContainerState::is_completed, timeout)
            .await
    }

    /// Fast tasks may complete before running is ever observed, so their
    /// start wait accepts either outcome.
    pub(crate) async fn wait_until_either_running_or_completed(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        self.inner
            .state
            .wait_until(
                |s| s == ContainerState::Running || s.is_completed(),
                timeout,
            )
            .await
    }

    /// Stop and kill act on a live workload; anything completed is a
    /// no-op for them and anything earlier is a caller error.
    pub(crate) fn require_running_or_unknown(&self) -> Result<()> {
        match self.state() {
            ContainerState::Running | ContainerState::Unknown | ContainerState::Terminating => {
                Ok(())
            }
            other => Err(Error::State(format!(
                "{} is not running, currently {other}",
                self.inner.spec.name
            ))),
        }
    }

    /// Walks the state to a deletable one along legal edges, used by
    /// forced deletion from any live state.
    pub(crate) fn force_completion(&self) {
        match self.state() {
            ContainerState::Uninitiated => {
                self.transition(ContainerState::Initializing);
                self.transition(ContainerState::Failed);
            }
            ContainerState::Initializing => {
                self.transition(ContainerState::Failed);
            }
            ContainerState::Running
            | ContainerState::Terminating
            | ContainerState::Unknown => {
                self.transition(ContainerState::Terminating);
                self.transition(ContainerState::Stopped);
            }
            ContainerState::Stopped | ContainerState::Failed | ContainerState::Deleted => {}
        }
    }

    pub(crate) fn require_state(&self, required: ContainerState) -> Result<()> {
        let current = self.state();
        if current == required {
            Ok(())
        } else {
            Err(Error::State(format!(
                "{} requires state {required}, currently {current}",
                self.inner.spec.name
            )))
        }
    }

    pub(crate) fn set_backend_id(&self, id: impl Into<String>) {
        let _ = self.inner.backend_id.set(id.into());
    }

    pub(crate) fn set_pod_name(&self, name: impl Into<String>) {
        let _ = self.inner.pod_name.set(name.into());
    }

    pub(crate) fn set_network_name(&self, name: impl Into<String>) {
        let _ = self.inner.network_name.set(name.into());
    }

    /// A custom Docker network owned by this container, if one was created.
    pub(crate) fn network_name(&self) -> Option<&str> {
        self.inner.network_name.get().map(String::as_str)
    }

    pub(crate) fn set_ip_address(&self, ip: IpAddr) {
        let _ = self.inner.ip_address.set(ip);
    }

    pub(crate) fn set_host(&self, host: impl Into<String>) {
        let _ = self.inner.host.set(host.into());
    }

    pub(crate) fn mark_started(&self) {
        let _ = self.inner.started_at.set(SystemTime::now());
    }

    pub(crate) fn set_started_at(&self, at: SystemTime) {
        let _ = self.inner.started_at.set(at);
    }

    pub(crate) fn mark_finished(&self) {
        let _ = self.inner.finished_at.set(SystemTime::now());
    }

    pub(crate) fn set_finished_at(&self, at: SystemTime) {
        let _ = self.inner.finished_at.set(at);
    }

    pub(crate) fn set_exit_code(&self, code: i64) {
        let _ = self.inner.exit_code.set(code);
    }

    /// Token cancelled on forced deletion, observed by watcher and
    /// streamer tasks.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn cancel_tasks(&self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Platform;

    fn handle() -> Container {
        Container::new(
            ContainerSpec::builder()
                .platform(Platform::Docker)
                .name("unit")
                .unwrap()
                .image("busybox")
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn starts_uninitiated() {
        let c = handle();
        assert_eq!(c.state(), ContainerState::Uninitiated);
        assert!(c.exit_code().is_none());
        assert!(c.duration().is_none());
    }

    #[test]
    fn single_assignment_cells_keep_first_write() {
        let c = handle();
        c.set_exit_code(0);
        c.set_exit_code(137);
        assert_eq!(c.exit_code(), Some(0));

        c.set_backend_id("abc");
        c.set_backend_id("def");
        assert_eq!(c.backend_id(), Some("abc"));
    }

    #[test]
    fn duration_uses_finish_when_completed() {
        let c = handle();
        let start = SystemTime::now() - Duration::from_secs(10);
        c.set_started_at(start);
        c.set_finished_at(start + Duration::from_secs(3));
        assert_eq!(c.duration(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn require_state_reports_both_states() {
        let c = handle();
        let err = c.require_state(ContainerState::Running).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("RUNNING"));
        assert!(text.contains("UNINITIATED"));
    }

    #[test]
    fn clones_share_the_workload() {
        let c = handle();
        let d = c.clone();
        c.transition(ContainerState::Initializing);
        assert_eq!(d.state(), ContainerState::Initializing);
    }
}
