use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container as K8sContainer, Pod, PodSpec,
            PodTemplateSpec, PersistentVolumeClaimVolumeSource, Volume as K8sVolume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    image::{BuildState, BuildStateCell, ImageBuildSpec},
    kubernetes::access,
    runtime::RuntimeConfig,
};

/// Where the shared context volume is mounted inside the Kaniko pod.
const KANIKO_MOUNT: &str = "/mnt/kaniko-data";
const KANIKO_EXECUTOR_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";
const CONTEXT_VOLUME: &str = "kaniko-data";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";

/// Runs Kaniko as an in-cluster Job against a context placed on the
/// shared `kaniko-data` volume, so no daemon is needed for the build.
pub struct KanikoImageBuilder {
    client: kube::Client,
    config: RuntimeConfig,
    spec: ImageBuildSpec,
    state: BuildStateCell,
}

impl KanikoImageBuilder {
    pub fn new(client: kube::Client, config: RuntimeConfig, spec: ImageBuildSpec) -> Self {
        Self {
            client,
            config,
            spec,
            state: BuildStateCell::new(),
        }
    }

    pub fn state(&self) -> BuildState {
        self.state.get()
    }

    pub fn spec(&self) -> &ImageBuildSpec {
        &self.spec
    }

    #[tracing::instrument(skip_all, fields(image = %self.spec.repository_path()))]
    pub async fn build(&self) -> Result<()> {
        self.state.transition(BuildState::InProgress);
        match self.run().await {
            Ok(()) => {
                self.state.transition(BuildState::Completed);
                Ok(())
            }
            Err(err) => {
                self.state.transition(BuildState::Failed);
                Err(err)
            }
        }
    }

    async fn run(&self) -> Result<()> {
        let namespace = self.spec.namespace.as_str();
        access::require_verbs(
            &self.client,
            Some(namespace),
            "batch",
            "jobs",
            &["create", "get", "delete"],
        )
        .await?;
        access::require_verbs(&self.client, Some(namespace), "", "pods", &["get", "list"]).await?;
        if self.spec.insecure_registry {
            access::require_verbs(
                &self.client,
                Some(namespace),
                "",
                "configmaps",
                &["create", "delete"],
            )
            .await?;
        }

        let (context, copied_dir) = self.resolve_context().await?;
        let token = Uuid::new_v4().simple().to_string();
        // job names share the 63 character budget with a generated suffix
        let short_name: String = self.spec.name.as_str().chars().take(40).collect();
        let job_name = format!("kaniko-{}-{}", short_name, &token[..8]);

        let config_map_name = if self.spec.insecure_registry {
            let name = format!("{job_name}-docker-config");
            self.create_docker_config(&name).await?;
            Some(name)
        } else {
            None
        };

        let outcome = self
            .run_job(&job_name, &context, config_map_name.as_deref())
            .await;

        // cleanup happens regardless of the build outcome
        if let Some(name) = &config_map_name {
            let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
            if let Err(err) = api.delete(name, &DeleteParams::default()).await {
                if !matches!(&err, kube::Error::Api(resp) if resp.code == 404) {
                    tracing::warn!(config_map = %name, "cleanup failed: {err}");
                }
            }
        }
        if let Some(dir) = copied_dir {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(context = %dir.display(), "cleanup failed: {err}");
            }
        }
        outcome
    }

    /// Reuses a context already on the shared volume, otherwise copies it
    /// into a fresh subdirectory that is removed after the build.
    async fn resolve_context(&self) -> Result<(String, Option<PathBuf>)> {
        let context_dir = &self.spec.context_dir;
        if !context_dir.join("Dockerfile").is_file() {
            return Err(Error::Build(format!(
                "no Dockerfile in context {}",
                context_dir.display()
            )));
        }
        if let Ok(relative) = context_dir.strip_prefix(KANIKO_MOUNT) {
            return Ok((join_mount(relative), None));
        }
        if let Ok(relative) = context_dir.strip_prefix(&self.config.kaniko_data_dir) {
            return Ok((join_mount(relative), None));
        }

        let token = Uuid::new_v4().to_string();
        let staged = self.config.kaniko_data_dir.join(&token);
        tracing::debug!(
            from = %context_dir.display(),
            to = %staged.display(),
            "copying build context onto the shared volume"
        );
        let source = context_dir.clone();
        let target = staged.clone();
        tokio::task::spawn_blocking(move || copy_dir_recursive(&source, &target))
            .await
            .map_err(|err| Error::Build(format!("context copy task failed: {err}")))??;
        Ok((format!("{KANIKO_MOUNT}/{token}"), Some(staged)))
    }

    async fn create_docker_config(&self, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), self.spec.namespace.as_str());
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(self.spec.namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "config.json".to_owned(),
                docker_config_json(&self.spec.registry),
            )])),
            ..Default::default()
        };
        api.create(&PostParams::default(), &config_map)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn run_job(
        &self,
        job_name: &str,
        context: &str,
        config_map: Option<&str>,
    ) -> Result<()> {
        let namespace = self.spec.namespace.as_str();
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let job = build_job(&self.spec, &self.config, job_name, context, config_map);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(Error::from)?;

        let cancel = CancellationToken::new();
        self.spawn_log_follower(job_name, cancel.clone());

        let budget = self.config.build_timeout;
        let deadline = tokio::time::Instant::now() + budget;
        let outcome = loop {
            let job = jobs.get(job_name).await.map_err(Error::from)?;
            let conditions = job
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_deref())
                .unwrap_or_default();
            if conditions
                .iter()
                .any(|c| c.type_ == "Complete" && c.status == "True")
            {
                break Ok(());
            }
            if let Some(failed) = conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
            {
                break Err(Error::Build(format!(
                    "kaniko job {job_name} failed: {}",
                    failed.message.as_deref().unwrap_or("no message")
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                break Err(Error::Timeout(budget));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        };
        cancel.cancel();
        outcome
    }

    /// Follows the build pod's log and forwards lines to the spec's
    /// output callback.
    fn spawn_log_follower(&self, job_name: &str, cancel: CancellationToken) {
        let client = self.client.clone();
        let namespace = self.spec.namespace.to_string();
        let job_name = job_name.to_owned();
        let spec = self.spec.clone();
        tokio::spawn(async move {
            let pods: Api<Pod> = Api::namespaced(client, &namespace);
            let selector = format!("job-name={job_name}");
            let params = ListParams::default().labels(&selector);

            let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
            let pod_name = loop {
                if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
                    return;
                }
                match pods.list(&params).await {
                    Ok(listed) => {
                        if let Some(name) = listed
                            .items
                            .into_iter()
                            .filter_map(|pod| pod.metadata.name)
                            .next()
                        {
                            break name;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(job = %job_name, "listing build pod failed: {err}");
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            };

            let reader = match pods
                .log_stream(
                    &pod_name,
                    &LogParams {
                        follow: true,
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(reader) => reader,
                Err(err) => {
                    tracing::debug!(pod = %pod_name, "opening build log failed: {err}");
                    return;
                }
            };
            let mut lines = reader.lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.try_next() => match line {
                        Ok(Some(line)) => spec.emit_line(&line),
                        Ok(None) | Err(_) => return,
                    }
                }
            }
        });
    }
}

fn join_mount(relative: &Path) -> String {
    let relative = relative.to_string_lossy();
    if relative.is_empty() {
        KANIKO_MOUNT.to_owned()
    } else {
        format!("{KANIKO_MOUNT}/{relative}")
    }
}

/// The executor's argument list for one build.
fn kaniko_args(spec: &ImageBuildSpec, context: &str) -> Vec<String> {
    let mut args = vec![
        format!("--dockerfile={context}/Dockerfile"),
        format!("--context=dir://{context}"),
        format!("--verbosity={}", spec.verbosity),
    ];
    for destination in spec.destinations() {
        args.push(format!("--destination={destination}"));
    }
    if spec.insecure_registry {
        args.push("--insecure".to_owned());
    }
    args
}

/// The `config.json` declaring each insecure registry to Kaniko.
fn docker_config_json(registry: &str) -> String {
    serde_json::json!({ "insecure-registries": [registry] }).to_string()
}

fn build_job(
    spec: &ImageBuildSpec,
    config: &RuntimeConfig,
    job_name: &str,
    context: &str,
    config_map: Option<&str>,
) -> Job {
    let mut volumes = vec![K8sVolume {
        name: CONTEXT_VOLUME.to_owned(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: config.kaniko_pvc.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: CONTEXT_VOLUME.to_owned(),
        mount_path: KANIKO_MOUNT.to_owned(),
        ..Default::default()
    }];
    if let Some(config_map) = config_map {
        volumes.push(K8sVolume {
            name: DOCKER_CONFIG_VOLUME.to_owned(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: DOCKER_CONFIG_VOLUME.to_owned(),
            mount_path: "/kaniko/.docker".to_owned(),
            ..Default::default()
        });
    }

    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_owned()),
            namespace: Some(spec.namespace.to_string()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(300),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    containers: vec![K8sContainer {
                        name: "kaniko".to_owned(),
                        image: Some(KANIKO_EXECUTOR_IMAGE.to_owned()),
                        args: Some(kaniko_args(spec, context)),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn copy_dir_recursive(source: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(insecure: bool) -> ImageBuildSpec {
        ImageBuildSpec::builder()
            .context_dir("/tmp/ctx")
            .registry("registry.local:5000")
            .unwrap()
            .repository("acme")
            .name("tools")
            .unwrap()
            .tag("v1")
            .unwrap()
            .tag("latest")
            .unwrap()
            .insecure_registry(insecure)
            .verbosity("debug")
            .build()
            .unwrap()
    }

    #[test]
    fn argument_synthesis() {
        let args = kaniko_args(&spec(true), "/mnt/kaniko-data/ctx");
        assert_eq!(args[0], "--dockerfile=/mnt/kaniko-data/ctx/Dockerfile");
        assert_eq!(args[1], "--context=dir:///mnt/kaniko-data/ctx");
        assert_eq!(args[2], "--verbosity=debug");
        assert!(args.contains(&"--destination=registry.local:5000/acme/tools:v1".to_owned()));
        assert!(args.contains(&"--destination=registry.local:5000/acme/tools:latest".to_owned()));
        assert_eq!(args.last().unwrap(), "--insecure");

        let secure = kaniko_args(&spec(false), "/mnt/kaniko-data/ctx");
        assert!(!secure.iter().any(|arg| arg == "--insecure"));
    }

    #[test]
    fn docker_config_declares_insecure_registries() {
        let parsed: serde_json::Value =
            serde_json::from_str(&docker_config_json("registry.local:5000")).unwrap();
        assert_eq!(
            parsed["insecure-registries"],
            serde_json::json!(["registry.local:5000"])
        );
    }

    #[test]
    fn job_shape() {
        let spec = spec(true);
        let config = RuntimeConfig::default();
        let job = build_job(&spec, &config, "kaniko-tools-abc", "/mnt/kaniko-data/x", Some("cm"));

        let js = job.spec.as_ref().unwrap();
        assert_eq!(js.backoff_limit, Some(0));
        assert_eq!(js.ttl_seconds_after_finished, Some(300));
        let pod = js.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.name == CONTEXT_VOLUME && m.mount_path == KANIKO_MOUNT));
        assert!(mounts
            .iter()
            .any(|m| m.name == DOCKER_CONFIG_VOLUME && m.mount_path == "/kaniko/.docker"));

        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "kaniko-data"
        );
    }

    #[test]
    fn copies_nested_context_directories() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("sub")).unwrap();
        std::fs::write(source.path().join("Dockerfile"), "FROM alpine:latest\n").unwrap();
        std::fs::write(source.path().join("sub/script.sh"), "#!/bin/sh\n").unwrap();

        let target = tempfile::tempdir().unwrap();
        let staged = target.path().join("staged");
        copy_dir_recursive(source.path(), &staged).unwrap();
        assert!(staged.join("Dockerfile").is_file());
        assert!(staged.join("sub/script.sh").is_file());
    }
}
