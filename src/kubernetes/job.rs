use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use tokio::io::AsyncWrite;

use crate::{
    container::Container,
    error::{Error, Result},
    kubernetes::{access, base::KubernetesBase, exec, labels, template},
    runtime::{ContainerRuntime, Execution, RuntimeConfig},
    state::ContainerState,
    values::RemotePath,
};

/// The run-to-completion runtime: a Batch Job with no retries and one
/// completion, whose final condition drives the completion wait.
#[derive(Clone)]
pub struct JobRuntime {
    base: KubernetesBase,
}

impl JobRuntime {
    pub fn new(client: kube::Client, config: RuntimeConfig) -> Self {
        Self {
            base: KubernetesBase::new(client, config),
        }
    }

    fn jobs(&self, container: &Container) -> Api<Job> {
        Api::namespaced(
            self.base.client.clone(),
            container.spec().namespace.as_str(),
        )
    }

    async fn preflight(&self, container: &Container) -> Result<()> {
        let spec = container.spec();
        let namespace = Some(spec.namespace.as_str());
        access::require_verbs(
            &self.base.client,
            namespace,
            "",
            "pods",
            &["get", "list", "watch"],
        )
        .await?;
        access::require_verbs(
            &self.base.client,
            namespace,
            "batch",
            "jobs",
            &["create", "delete", "get"],
        )
        .await?;
        if !spec.container_files.is_empty() {
            access::require_verbs(
                &self.base.client,
                namespace,
                "",
                "configmaps",
                &["create", "delete"],
            )
            .await?;
        }
        Ok(())
    }

    async fn deploy(&self, container: &Container) -> Result<()> {
        let spec = container.spec();
        self.preflight(container).await?;
        self.base.ensure_namespace(spec).await?;

        match self
            .jobs(container)
            .delete(spec.name.as_str(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                while self.jobs(container).get(spec.name.as_str()).await.is_ok() {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
        self.base.apply_config_maps(container).await?;

        let labels = labels::default_labels(spec, container.instance_id());
        let job = template::job(spec, &labels)?;
        self.jobs(container)
            .create(&PostParams::default(), &job)
            .await
            .map_err(Error::from)?;
        container.set_backend_id(spec.name.to_string());

        self.base.attach_to_pod(container, true).await?;
        self.base.await_started(container, true).await?;

        if let Some(max_life) = spec.max_life_time {
            crate::runtime::schedule_kill(std::sync::Arc::new(self.clone()), container, max_life);
        }
        Ok(())
    }

    /// Reads the Job's terminal condition, if any.
    fn job_outcome(job: &Job) -> Option<(bool, Option<SystemTime>, Option<SystemTime>)> {
        let status = job.status.as_ref()?;
        let conditions = status.conditions.as_deref().unwrap_or_default();
        let terminal = conditions.iter().find(|condition| {
            condition.status == "True"
                && (condition.type_ == "Complete" || condition.type_ == "Failed")
        })?;
        let started = status.start_time.as_ref().map(|time| SystemTime::from(time.0));
        let finished = status
            .completion_time
            .as_ref()
            .map(|time| SystemTime::from(time.0))
            .or_else(|| {
                terminal
                    .last_transition_time
                    .as_ref()
                    .map(|time| SystemTime::from(time.0))
            });
        Some((terminal.type_ == "Complete", started, finished))
    }
}

#[async_trait]
impl ContainerRuntime for JobRuntime {
    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn start(&self, container: &Container) -> Result<()> {
        container.require_state(ContainerState::Uninitiated)?;
        container.transition(ContainerState::Initializing);
        match self.deploy(container).await {
            Ok(()) => Ok(()),
            Err(err) => {
                container.transition(ContainerState::Failed);
                Err(err)
            }
        }
    }

    /// A task does not scale; stopping one deletes its pods and lets the
    /// Job object stand until deletion.
    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn stop(&self, container: &Container) -> Result<()> {
        if container.state().is_completed() {
            return Ok(());
        }
        container.require_running_or_unknown()?;
        container.transition(ContainerState::Terminating);

        self.base.delete_pods(container, false).await?;
        self.base.await_pods_gone(container).await?;

        container.mark_finished();
        container.transition(ContainerState::Stopped);

        // an ephemeral workload does not outlive its stop
        if container.spec().ephemeral {
            self.delete(container, false).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn kill(&self, container: &Container) -> Result<()> {
        if container.state().is_completed() {
            return Ok(());
        }
        container.require_running_or_unknown()?;
        container.transition(ContainerState::Terminating);

        self.base.delete_pods(container, true).await?;

        container.mark_finished();
        container.transition(ContainerState::Stopped);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name, force))]
    async fn delete(&self, container: &Container, force: bool) -> Result<()> {
        if container.state() == ContainerState::Deleted {
            return Ok(());
        }
        if !force && !container.state().is_completed() {
            return Err(Error::State(format!(
                "delete requires a completed container, currently {}",
                container.state()
            )));
        }
        if force {
            container.cancel_tasks();
            container.force_completion();
        }

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self
            .jobs(container)
            .delete(container.spec().name.as_str(), &params)
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => tracing::warn!(
                container.name = %container.spec().name,
                "delete failed: {err}"
            ),
        }
        self.base.delete_config_maps(container).await;

        container.transition(ContainerState::Deleted);
        Ok(())
    }

    /// Watches the Job until a `Complete` or `Failed` condition shows up
    /// and derives the final state from it.
    async fn wait_for_completion(
        &self,
        container: &Container,
        timeout: Option<Duration>,
    ) -> Result<i64> {
        let jobs = self.jobs(container);
        let name = container.spec().name.as_str().to_owned();
        let deadline = timeout.map(|budget| tokio::time::Instant::now() + budget);

        loop {
            if container.state().is_completed() && container.exit_code().is_some() {
                break;
            }
            let job = jobs.get(&name).await.map_err(Error::from)?;
            if let Some((_completed, started, finished)) = Self::job_outcome(&job) {
                if let Some(started) = started {
                    container.set_started_at(started);
                }
                if let Some(finished) = finished {
                    container.set_finished_at(finished);
                }
                // the pod watcher usually beat us to the exit code; fall
                // back to reading the pod directly
                if container.exit_code().is_none() {
                    let pods = self.base.pods(container.spec());
                    if let Some(pod_name) = container.pod_name() {
                        if let Ok(pod) = pods.get(pod_name).await {
                            crate::kubernetes::watch::apply_pod_event(container, &pod, true);
                        }
                    }
                }
                if !container.state().is_completed() {
                    container.transition(ContainerState::Stopped);
                }
                break;
            }
            match deadline {
                Some(deadline) if tokio::time::Instant::now() >= deadline => {
                    return Err(Error::Timeout(timeout.unwrap_or_default()));
                }
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        container
            .exit_code()
            .ok_or_else(|| Error::Backend("backend reported no exit code".to_owned()))
    }

    async fn execute(
        &self,
        container: &Container,
        exec: &str,
        args: &[String],
        use_tty: bool,
        working_dir: Option<&RemotePath>,
        input: Option<Vec<u8>>,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        timeout: Option<Duration>,
    ) -> Result<Execution> {
        exec::execute(
            &self.base.client,
            container,
            exec,
            args,
            use_tty,
            working_dir,
            input,
            output,
            timeout,
        )
        .await
    }

    async fn put_file(
        &self,
        container: &Container,
        local: &Path,
        remote_dir: &RemotePath,
        remote_name: Option<&str>,
    ) -> Result<u64> {
        exec::put_file(&self.base.client, container, local, remote_dir, remote_name).await
    }

    async fn get_file(
        &self,
        container: &Container,
        remote_dir: &RemotePath,
        remote_name: &str,
        local: Option<&Path>,
    ) -> Result<PathBuf> {
        exec::get_file(&self.base.client, container, remote_dir, remote_name, local).await
    }

    async fn put_directory(
        &self,
        container: &Container,
        local: &Path,
        remote_dir: &RemotePath,
    ) -> Result<u64> {
        exec::put_directory(&self.base.client, container, local, remote_dir).await
    }

    async fn get_directory(
        &self,
        container: &Container,
        remote_dir: &RemotePath,
        local: &Path,
    ) -> Result<(PathBuf, Vec<PathBuf>)> {
        exec::get_directory(&self.base.client, container, remote_dir, local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::batch::v1::{JobCondition, JobStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    fn job_with(conditions: Vec<JobCondition>) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(conditions),
                start_time: Some(Time(chrono::Utc::now())),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn complete_condition_is_terminal() {
        let job = job_with(vec![JobCondition {
            type_: "Complete".to_owned(),
            status: "True".to_owned(),
            last_transition_time: Some(Time(chrono::Utc::now())),
            ..Default::default()
        }]);
        let (completed, started, finished) = JobRuntime::job_outcome(&job).unwrap();
        assert!(completed);
        assert!(started.is_some());
        assert!(finished.is_some());
    }

    #[test]
    fn failed_condition_is_terminal() {
        let job = job_with(vec![JobCondition {
            type_: "Failed".to_owned(),
            status: "True".to_owned(),
            last_transition_time: Some(Time(chrono::Utc::now())),
            ..Default::default()
        }]);
        let (completed, _, finished) = JobRuntime::job_outcome(&job).unwrap();
        assert!(!completed);
        assert!(finished.is_some());
    }

    #[test]
    fn false_or_absent_conditions_are_not_terminal() {
        assert!(JobRuntime::job_outcome(&job_with(vec![])).is_none());
        let job = job_with(vec![JobCondition {
            type_: "Complete".to_owned(),
            status: "False".to_owned(),
            ..Default::default()
        }]);
        assert!(JobRuntime::job_outcome(&job).is_none());
    }
}
