use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bollard::secret::{
    ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, MountTmpfsOptions, PortBinding,
};
use futures::StreamExt;
use tokio::io::AsyncWrite;

use crate::{
    container::Container,
    docker::{archive, exec, stream},
    error::{Error, Result},
    runtime::{ContainerRuntime, Execution, RuntimeConfig},
    spec::{ContainerSpec, NATIVE_ENTRYPOINT_PROPERTY},
    state::ContainerState,
    values::{NetworkMode, RemotePath},
};

/// The daemon-backed runtime. One instance serves any number of
/// containers; the underlying client is shared and concurrency safe.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: bollard::Docker,
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn new(docker: bollard::Docker, config: RuntimeConfig) -> Self {
        Self { docker, config }
    }

    async fn ensure_image(&self, spec: &ContainerSpec) -> Result<()> {
        let reference = spec.image.to_string();
        if self.docker.inspect_image(&reference).await.is_ok() {
            tracing::debug!(image = %reference, "image present");
            return Ok(());
        }

        tracing::info!(image = %reference, "pulling image");
        let mut progress = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(update) = progress.next().await {
            let update = update.map_err(Error::from)?;
            if let Some(status) = update.status {
                tracing::debug!(image = %reference, "{status}");
            }
        }
        Ok(())
    }

    /// Resolves the network mode string, creating an absent user-defined
    /// network and recording ownership on the handle for teardown.
    async fn resolve_network(&self, container: &Container) -> Result<Option<String>> {
        let network = match &container.spec().network {
            None => return Ok(None),
            Some(network) => network,
        };
        if let NetworkMode::Custom(name) = network {
            let mut filters = HashMap::new();
            filters.insert("name".to_owned(), vec![name.clone()]);
            let known = self
                .docker
                .list_networks(Some(bollard::network::ListNetworksOptions { filters }))
                .await
                .map_err(Error::from)?;
            let exists = known
                .iter()
                .any(|n| n.name.as_deref() == Some(name.as_str()));
            if !exists {
                tracing::debug!(network = %name, "creating network");
                self.docker
                    .create_network(bollard::network::CreateNetworkOptions {
                        name: name.clone(),
                        driver: "bridge".to_owned(),
                        ..Default::default()
                    })
                    .await
                    .map_err(Error::from)?;
                container.set_network_name(name.clone());
            }
        }
        Ok(Some(network.to_string()))
    }

    /// Mount assembly: named volumes when the daemon knows one by that
    /// name, host binds otherwise, tmpfs for memory-backed volumes, and a
    /// one-file bind per container file.
    async fn assemble_mounts(&self, spec: &ContainerSpec) -> Result<Vec<Mount>> {
        let mut mounts = Vec::new();
        for volume in &spec.volumes {
            if volume.memory_backed {
                mounts.push(Mount {
                    target: Some(volume.mount_dir.as_str().to_owned()),
                    typ: Some(MountTypeEnum::TMPFS),
                    tmpfs_options: volume.memory.map(|size| MountTmpfsOptions {
                        size_bytes: Some(size.as_bytes() as i64),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                continue;
            }

            let mut filters = HashMap::new();
            filters.insert("name".to_owned(), vec![volume.name.clone()]);
            let listed = self
                .docker
                .list_volumes(Some(bollard::volume::ListVolumesOptions { filters }))
                .await
                .map_err(Error::from)?;
            let named_exists = listed
                .volumes
                .unwrap_or_default()
                .iter()
                .any(|v| v.name == volume.name);

            if named_exists {
                mounts.push(Mount {
                    source: Some(volume.name.clone()),
                    target: Some(volume.mount_dir.as_str().to_owned()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                });
            } else if let Some(host_dir) = &volume.host_dir {
                mounts.push(Mount {
                    source: Some(host_dir.to_string_lossy().into_owned()),
                    target: Some(volume.mount_dir.as_str().to_owned()),
                    typ: Some(MountTypeEnum::BIND),
                    ..Default::default()
                });
            } else {
                return Err(Error::NotFound(format!(
                    "volume {:?} is neither a daemon volume nor a host bind",
                    volume.name
                )));
            }
        }

        for file in &spec.container_files {
            let host_file = match (&file.host_file, &file.content) {
                (Some(host_file), _) => host_file.clone(),
                (None, Some(content)) => {
                    // content-only files are staged under a temp dir
                    let staged = crate::paths::unique_temp_dir()?.join(&file.name);
                    tokio::fs::write(&staged, content).await?;
                    staged
                }
                (None, None) => unreachable!("validated at build time"),
            };
            mounts.push(Mount {
                source: Some(host_file.to_string_lossy().into_owned()),
                target: Some(file.mount_path.as_str().to_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            });
        }
        Ok(mounts)
    }

    async fn create_and_start(&self, container: &Container) -> Result<()> {
        let spec = container.spec();
        let name = spec.name.as_str().to_owned();

        self.ensure_image(spec).await?;
        let network_mode = self.resolve_network(container).await?;
        let mounts = self.assemble_mounts(spec).await?;
        let (entrypoint, cmd) = materialize_command(spec);
        let (exposed_ports, port_bindings) = port_arguments(spec);

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        tracing::debug!(container.name = %name, "creating container");
        let created = self
            .docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                bollard::container::Config {
                    image: Some(spec.image.to_string()),
                    entrypoint,
                    cmd,
                    env: Some(env),
                    labels: Some(spec.labels.clone().into_iter().collect()),
                    exposed_ports,
                    host_config: Some(HostConfig {
                        auto_remove: Some(spec.ephemeral),
                        network_mode,
                        port_bindings,
                        mounts: Some(mounts),
                        memory: spec.memory_limit.map(|m| m.as_bytes() as i64),
                        memory_reservation: spec.memory_request.map(|m| m.as_bytes() as i64),
                        nano_cpus: spec.cpu_limit.map(|c| c.as_nano_cpus()),
                        cpu_shares: spec.cpu_request.map(|c| c.as_millis() as i64),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::from)?;
        container.set_backend_id(created.id);
        container.set_host(name.clone());

        // subscribe before start so no early output is missed
        stream::spawn_log_subscriber(self.docker.clone(), container.clone());

        tracing::debug!(container.name = %name, "starting container");
        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(Error::from)?;

        self.await_running(container).await?;

        if let Some(max_life) = spec.max_life_time {
            crate::runtime::schedule_kill(Arc::new(self.clone()), container, max_life);
        }
        Ok(())
    }

    /// Polls the daemon once a second until the container is observed
    /// running, failing on a terminal status or the start budget.
    async fn await_running(&self, container: &Container) -> Result<()> {
        let name = container.spec().name.as_str();
        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            let inspected = self
                .docker
                .inspect_container(name, None)
                .await
                .map_err(Error::from)?;
            let status = inspected
                .state
                .as_ref()
                .and_then(|s| s.status)
                .unwrap_or(ContainerStateStatusEnum::EMPTY);
            match status {
                ContainerStateStatusEnum::RUNNING => {
                    if let Some(ip) = inspected
                        .network_settings
                        .as_ref()
                        .and_then(|settings| settings.networks.as_ref())
                        .and_then(|networks| {
                            networks
                                .values()
                                .filter_map(|endpoint| endpoint.ip_address.as_deref())
                                .find(|ip| !ip.is_empty())
                        })
                        .and_then(|ip| ip.parse().ok())
                    {
                        container.set_ip_address(ip);
                    }
                    container.mark_started();
                    container.transition(ContainerState::Running);
                    return Ok(());
                }
                ContainerStateStatusEnum::EXITED
                | ContainerStateStatusEnum::DEAD
                | ContainerStateStatusEnum::REMOVING => {
                    return Err(Error::Backend(format!(
                        "container {name} reached {status} before running"
                    )));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(self.config.start_timeout));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Common stop/kill path: signal, then wait for the daemon's terminal
    /// event and record the exit.
    async fn halt(&self, container: &Container, kill: bool) -> Result<()> {
        if container.state().is_completed() {
            return Ok(());
        }
        container.require_running_or_unknown()?;
        container.transition(ContainerState::Terminating);

        let name = container.spec().name.as_str();
        let signal_result = if kill {
            self.docker
                .kill_container(
                    name,
                    Some(bollard::container::KillContainerOptions { signal: "SIGKILL" }),
                )
                .await
        } else {
            self.docker
                .stop_container(name, Some(bollard::container::StopContainerOptions { t: 10 }))
                .await
        };
        match signal_result {
            Ok(()) => {}
            // already gone counts as stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {}
            Err(err) => {
                container.transition(ContainerState::Failed);
                return Err(err.into());
            }
        }

        let mut wait = self.docker.wait_container::<String>(name, None);
        if let Some(Ok(exit)) = wait.next().await {
            container.set_exit_code(exit.status_code);
        }
        container.mark_finished();
        container.transition(ContainerState::Stopped);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn start(&self, container: &Container) -> Result<()> {
        container.require_state(ContainerState::Uninitiated)?;
        container.transition(ContainerState::Initializing);
        match self.create_and_start(container).await {
            Ok(()) => Ok(()),
            Err(err) => {
                container.transition(ContainerState::Failed);
                Err(err)
            }
        }
    }

    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn stop(&self, container: &Container) -> Result<()> {
        self.halt(container, false).await
    }

    #[tracing::instrument(skip_all, fields(container.name = %container.spec().name))]
    async fn kill(&self, container: &Container) -> Result<()> {
        self.halt(container, true).await
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
        match self
            .docker
            .remove_container(
                name,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            // ephemeral containers auto-remove on exit
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => {}
            Err(err) if force => {
                tracing::warn!("removing container failed during forced delete: {err}")
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(network) = container.network_name() {
            if let Err(err) = self.docker.remove_network(network).await {
                tracing::warn!(network, "removing container network failed: {err}");
            }
        }
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
            &self.docker,
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
        archive::put_file(&self.docker, container, local, remote_dir, remote_name).await
    }

    async fn get_file(
        &self,
        container: &Container,
        remote_dir: &RemotePath,
        remote_name: &str,
        local: Option<&Path>,
    ) -> Result<PathBuf> {
        archive::get_file(&self.docker, container, remote_dir, remote_name, local).await
    }

    async fn put_directory(
        &self,
        container: &Container,
        local: &Path,
        remote_dir: &RemotePath,
    ) -> Result<u64> {
        archive::put_directory(&self.docker, container, local, remote_dir).await
    }

    async fn get_directory(
        &self,
        container: &Container,
        remote_dir: &RemotePath,
        local: &Path,
    ) -> Result<(PathBuf, Vec<PathBuf>)> {
        archive::get_directory(&self.docker, container, remote_dir, local).await
    }
}

/// Entry-point strategy: unless the native property is set, command and
/// arguments are folded into one `/bin/sh -c` string so images with their
/// own entrypoints behave uniformly.
pub(crate) fn materialize_command(
    spec: &ContainerSpec,
) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let command = match &spec.command {
        None => return (None, None),
        Some(command) => command.clone(),
    };
    if spec.property_enabled(NATIVE_ENTRYPOINT_PROPERTY) {
        return (Some(vec![command]), Some(spec.args.clone()));
    }
    let mut script = command;
    for arg in &spec.args {
        script.push(' ');
        script.push_str(arg);
    }
    (
        Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
        Some(vec![script]),
    )
}

/// Exposed-port and binding maps in the daemon's `port/tcp` form.
#[allow(clippy::type_complexity)]
pub(crate) fn port_arguments(
    spec: &ContainerSpec,
) -> (
    Option<HashMap<String, HashMap<(), ()>>>,
    Option<HashMap<String, Option<Vec<PortBinding>>>>,
) {
    let mut exposed = HashMap::new();
    for port in spec.exposed_ports.values() {
        exposed.insert(format!("{port}/tcp"), HashMap::new());
    }
    let mut bindings = HashMap::new();
    for (container_port, host_port) in &spec.port_mappings {
        exposed.entry(format!("{container_port}/tcp")).or_default();
        bindings.insert(
            format!("{container_port}/tcp"),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }
    (Some(exposed), Some(bindings))
}
