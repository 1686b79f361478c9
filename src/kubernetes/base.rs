use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};

use crate::{
    container::Container,
    error::{Error, Result},
    kubernetes::{access, labels, template, watch},
    runtime::RuntimeConfig,
    spec::ContainerSpec,
    state::ContainerState,
};

/// Shared plumbing of both Kubernetes runtimes: namespace handling,
/// ConfigMap materialization, pod attachment and drain waits. The
/// workload objects themselves differ per runtime.
#[derive(Clone)]
pub(crate) struct KubernetesBase {
    pub(crate) client: kube::Client,
    pub(crate) config: RuntimeConfig,
}

impl KubernetesBase {
    pub(crate) fn new(client: kube::Client, config: RuntimeConfig) -> Self {
        Self { client, config }
    }

    pub(crate) fn pods(&self, spec: &ContainerSpec) -> Api<Pod> {
        Api::namespaced(self.client.clone(), spec.namespace.as_str())
    }

    pub(crate) fn config_maps_api(&self, spec: &ContainerSpec) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), spec.namespace.as_str())
    }

    /// Creates the namespace when absent and RBAC allows it; an existing
    /// namespace or a denied create verb both pass through quietly.
    pub(crate) async fn ensure_namespace(&self, spec: &ContainerSpec) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get(spec.namespace.as_str()).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
        if !access::verb_allowed(&self.client, None, "", "namespaces", "create").await? {
            tracing::debug!(
                namespace = %spec.namespace,
                "namespace absent and creation not permitted"
            );
            return Ok(());
        }
        tracing::info!(namespace = %spec.namespace, "creating namespace");
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(spec.namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            // racing another creator is fine
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the ConfigMaps materializing the spec's container files.
    pub(crate) async fn apply_config_maps(&self, container: &Container) -> Result<()> {
        let spec = container.spec();
        if spec.container_files.is_empty() {
            return Ok(());
        }
        let api = self.config_maps_api(spec);
        let labels = labels::default_labels(spec, container.instance_id());
        for config_map in template::config_maps(spec, &labels)? {
            let name = config_map
                .metadata
                .name
                .clone()
                .unwrap_or_default();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(err) => return Err(err.into()),
            }
            api.create(&PostParams::default(), &config_map)
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }

    pub(crate) async fn delete_config_maps(&self, container: &Container) {
        let spec = container.spec();
        let api = self.config_maps_api(spec);
        for file in &spec.container_files {
            let name = template::config_map_name(spec, file);
            if let Err(err) = api.delete(&name, &DeleteParams::default()).await {
                if !matches!(&err, kube::Error::Api(resp) if resp.code == 404) {
                    tracing::warn!(config_map = %name, "deleting config map failed: {err}");
                }
            }
        }
    }

    /// Attaches the watcher, waits for exactly one pod, and starts the
    /// log streamer on it.
    pub(crate) async fn attach_to_pod(&self, container: &Container, task_mode: bool) -> Result<()> {
        watch::spawn_pod_watcher(self.client.clone(), container.clone(), task_mode);

        let pod = watch::await_single_pod(
            &self.pods(container.spec()),
            container,
            self.config.start_timeout,
        )
        .await?;
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Backend("pod without a name".to_owned()))?;
        container.set_pod_name(pod_name.clone());
        container.set_host(pod_name.clone());
        if let Some(ip) = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.as_deref())
            .and_then(|ip| ip.parse().ok())
        {
            container.set_ip_address(ip);
        }

        watch::spawn_log_streamer(self.client.clone(), container.clone(), pod_name);
        Ok(())
    }

    /// Blocks until the watcher observes the workload running (services)
    /// or running-or-completed (tasks), within the start budget.
    pub(crate) async fn await_started(&self, container: &Container, task_mode: bool) -> Result<()> {
        let budget = self.config.start_timeout;
        let reached = if task_mode {
            container
                .wait_until_either_running_or_completed(Some(budget))
                .await
        } else {
            container
                .wait_for_state(ContainerState::Running, Some(budget))
                .await
        };
        if !reached {
            return Err(Error::Timeout(budget));
        }
        if container.state() == ContainerState::Failed {
            return Err(Error::Backend(format!(
                "{} failed before running",
                container.spec().name
            )));
        }
        Ok(())
    }

    /// Waits until no pod matches the handle's instance label anymore.
    pub(crate) async fn await_pods_gone(&self, container: &Container) -> Result<()> {
        let pods = self.pods(container.spec());
        let selector = labels::instance_selector(container.instance_id());
        let params = ListParams::default().labels(&selector);
        let budget = self.config.stop_timeout;
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let listed = pods.list(&params).await.map_err(Error::from)?;
            if listed.items.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(budget));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Deletes every pod matching the instance label, used by kill paths.
    pub(crate) async fn delete_pods(&self, container: &Container, grace_zero: bool) -> Result<()> {
        let pods = self.pods(container.spec());
        let selector = labels::instance_selector(container.instance_id());
        let listed = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::from)?;
        let params = if grace_zero {
            DeleteParams {
                grace_period_seconds: Some(0),
                ..Default::default()
            }
        } else {
            DeleteParams::default()
        };
        for pod in listed.items {
            if let Some(name) = pod.metadata.name.as_deref() {
                match pods.delete(name, &params).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }
}
