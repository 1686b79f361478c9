use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use tokio::io::AsyncWrite;

use crate::{
    container::Container,
    error::{Error, Result},
    kubernetes::{access, base::KubernetesBase, exec, labels, template},
    runtime::{ContainerRuntime, Execution, RuntimeConfig},
    state::ContainerState,
    values::RemotePath,
};

/// The long-running-service runtime: one Deployment with a single
/// replica, plus a Service in front of it when ports are exposed.
#[derive(Clone)]
pub struct ServiceRuntime {
    base: KubernetesBase,
}

impl ServiceRuntime {
    pub fn new(client: kube::Client, config: RuntimeConfig) -> Self {
        Self {
            base: KubernetesBase::new(client, config),
        }
    }

    fn deployments(&self, container: &Container) -> Api<Deployment> {
        Api::namespaced(
            self.base.client.clone(),
            container.spec().namespace.as_str(),
        )
    }

    fn services(&self, container: &Container) -> Api<Service> {
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
            "apps",
            "deployments",
            &["create", "delete", "get"],
        )
        .await?;
        if !spec.exposed_ports.is_empty() {
            access::require_verbs(
                &self.base.client,
                namespace,
                "",
                "services",
                &["create", "delete"],
            )
            .await?;
        }
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

        // a stale workload of the same name would fight the new one
        self.remove_workload(container).await?;
        self.base.apply_config_maps(container).await?;

        let labels = labels::default_labels(spec, container.instance_id());
        let deployment = template::deployment(spec, &labels)?;
        self.deployments(container)
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(Error::from)?;
        container.set_backend_id(spec.name.to_string());

        if !spec.exposed_ports.is_empty() {
            let node_port = !labels::in_cluster();
            let service = template::service(spec, &labels, node_port)?;
            self.services(container)
                .create(&PostParams::default(), &service)
                .await
                .map_err(Error::from)?;
        }

        self.base.attach_to_pod(container, false).await?;
        self.base.await_started(container, false).await?;

        if let Some(max_life) = spec.max_life_time {
            crate::runtime::schedule_kill(std::sync::Arc::new(self.clone()), container, max_life);
        }
        Ok(())
    }

    async fn remove_workload(&self, container: &Container) -> Result<()> {
        let name = container.spec().name.as_str();
        match self
            .deployments(container)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                // wait out the old replica set before re-creating
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                while self.deployments(container).get(name).await.is_ok() {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
        match self
            .services(container)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for ServiceRuntime {
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

    /// Scales the Deployment to zero and waits for the pod to drain.
    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn stop(&self, container: &Container) -> Result<()> {
        if container.state().is_completed() {
            return Ok(());
        }
        container.require_running_or_unknown()?;
        container.transition(ContainerState::Terminating);

        let name = container.spec().name.as_str();
        let scale_down = serde_json::json!({"spec": {"replicas": 0}});
        self.deployments(container)
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&scale_down))
            .await
            .map_err(Error::from)?;
        self.base.await_pods_gone(container).await?;

        container.mark_finished();
        container.transition(ContainerState::Stopped);

        // an ephemeral workload does not outlive its stop
        if container.spec().ephemeral {
            self.delete(container, false).await?;
        }
        Ok(())
    }

    /// Foreground deletion with zero grace, then each pod explicitly.
    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn kill(&self, container: &Container) -> Result<()> {
        if container.state().is_completed() {
            return Ok(());
        }
        container.require_running_or_unknown()?;
        container.transition(ContainerState::Terminating);

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self
            .deployments(container)
            .delete(container.spec().name.as_str(), &params)
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => {
                container.transition(ContainerState::Failed);
                return Err(err.into());
            }
        }
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

        let name = container.spec().name.as_str();
        for outcome in [
            self.deployments(container)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
            self.services(container)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        ] {
            match outcome {
                Ok(()) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                // teardown keeps going, remaining resources still get removed
                Err(err) => tracing::warn!(container.name = %name, "delete failed: {err}"),
            }
        }
        self.base.delete_config_maps(container).await;

        container.transition(ContainerState::Deleted);
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        container: &Container,
        timeout: Option<Duration>,
    ) -> Result<i64> {
        if !container.wait_until_completed(timeout).await {
            return Err(Error::Timeout(timeout.unwrap_or_default()));
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
