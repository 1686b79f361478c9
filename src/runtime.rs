use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::OnceCell;

use crate::{
    container::Container,
    docker::DockerRuntime,
    error::Result,
    kubernetes::{JobRuntime, ServiceRuntime},
    spec::{ContainerSpec, ExecutionMode, Platform},
    values::RemotePath,
};

/// The outcome of one [ContainerRuntime::execute] call. A `None` exit code
/// means the command was cut off by the timeout. stderr is always captured
/// separately from the caller's stdout sink, never merged.
#[derive(Debug, Clone)]
pub struct Execution {
    pub exit_code: Option<i64>,
    pub stderr: String,
}

/// Budgets and backend addressing, passed at factory construction. A
/// process-wide default exists for convenience but nothing in the crate
/// depends on it.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Daemon address; `None` lets the daemon client honor `DOCKER_HOST`
    /// and fall back to the platform default socket.
    pub docker_host: Option<String>,
    /// Maximum wait for a started workload to be observed running.
    pub start_timeout: Duration,
    /// Maximum wait for pods to drain on stop.
    pub stop_timeout: Duration,
    /// Maximum wait for an image build job.
    pub build_timeout: Duration,
    /// Local mount of the shared Kaniko context volume.
    pub kaniko_data_dir: PathBuf,
    /// Claim name of the shared Kaniko context volume.
    pub kaniko_pvc: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(600),
            kaniko_data_dir: PathBuf::from("/mnt/kaniko-data"),
            kaniko_pvc: "kaniko-data".to_owned(),
        }
    }
}

/// Platform-agnostic operations every backend realizes.
///
/// All methods are synchronous from the caller's point of view; runtimes
/// fan out to watcher tasks internally. The handle is passed explicitly
/// into every call, runtimes hold no per-container state of their own.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates the backend resources and returns once the workload is
    /// observed running. Transitions `Uninitiated → Initializing →
    /// Running`; exceeding the start budget fails the container.
    async fn start(&self, container: &Container) -> Result<()>;

    /// Gracefully stops the workload and waits for it to terminate. A
    /// no-op when the container already completed.
    async fn stop(&self, container: &Container) -> Result<()>;

    /// Forcibly terminates the workload (SIGKILL semantics).
    async fn kill(&self, container: &Container) -> Result<()>;

    /// Removes the backend resources. Without `force` the container must
    /// be stopped or failed; with `force` the call is legal in any state
    /// and idempotent.
    async fn delete(&self, container: &Container, force: bool) -> Result<()>;

    /// Blocks until the workload completes and returns its exit code.
    async fn wait_for_completion(
        &self,
        container: &Container,
        timeout: Option<Duration>,
    ) -> Result<i64>;

    /// Runs a process inside the running container. stdout is streamed to
    /// `output`; stderr is captured and returned.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<Execution>;

    /// Uploads one local file into `remote_dir` (created if missing),
    /// returning the transferred byte count.
    async fn put_file(
        &self,
        container: &Container,
        local: &Path,
        remote_dir: &RemotePath,
        remote_name: Option<&str>,
    ) -> Result<u64>;

    /// Downloads one remote file, returning the resolved local path.
    async fn get_file(
        &self,
        container: &Container,
        remote_dir: &RemotePath,
        remote_name: &str,
        local: Option<&Path>,
    ) -> Result<PathBuf>;

    /// Uploads a local directory tree into `remote_dir` (created if
    /// missing), returning the transferred byte count.
    async fn put_directory(
        &self,
        container: &Container,
        local: &Path,
        remote_dir: &RemotePath,
    ) -> Result<u64>;

    /// Downloads a remote directory tree into `local`, returning the
    /// parent directory and the extracted files.
    async fn get_directory(
        &self,
        container: &Container,
        remote_dir: &RemotePath,
        local: &Path,
    ) -> Result<(PathBuf, Vec<PathBuf>)>;
}

/// One scheduled kill per handle when `max_life_time` is set, cancelled
/// together with the handle's other tasks.
pub(crate) fn schedule_kill(
    runtime: Arc<dyn ContainerRuntime>,
    container: &Container,
    max_life: Duration,
) {
    let cancel = container.cancel_token();
    let container = container.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(max_life) => {
                tracing::info!(
                    container.name = %container.spec().name,
                    "max life time reached, killing"
                );
                if let Err(err) = runtime.kill(&container).await {
                    tracing::warn!("kill after max life time failed: {err}");
                }
            }
        }
    });
}

/// Hands out the runtime matching a spec's platform and mode. Backend
/// clients are created lazily on first use and shared across containers;
/// both are safe for concurrent use.
pub struct RuntimeFactory {
    config: RuntimeConfig,
    docker: OnceCell<bollard::Docker>,
    kube: OnceCell<kube::Client>,
}

impl RuntimeFactory {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            docker: OnceCell::new(),
            kube: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The shared daemon client.
    pub async fn docker(&self) -> Result<bollard::Docker> {
        let docker = self
            .docker
            .get_or_try_init(|| crate::docker::connect(&self.config))
            .await?;
        Ok(docker.clone())
    }

    /// The shared cluster client: in-cluster configuration when running
    /// inside a pod, the default kubeconfig otherwise.
    pub async fn kube(&self) -> Result<kube::Client> {
        let client = self
            .kube
            .get_or_try_init(|| async {
                kube::Client::try_default()
                    .await
                    .map_err(crate::error::Error::from)
            })
            .await?;
        Ok(client.clone())
    }

    /// A builder running on the local daemon.
    pub async fn daemon_image_builder(
        &self,
        spec: crate::image::ImageBuildSpec,
    ) -> Result<crate::image::DaemonImageBuilder> {
        Ok(crate::image::DaemonImageBuilder::new(
            self.docker().await?,
            spec,
        ))
    }

    /// A builder running as an in-cluster Kaniko job.
    pub async fn kaniko_image_builder(
        &self,
        spec: crate::image::ImageBuildSpec,
    ) -> Result<crate::image::KanikoImageBuilder> {
        Ok(crate::image::KanikoImageBuilder::new(
            self.kube().await?,
            self.config.clone(),
            spec,
        ))
    }

    /// Selects and constructs the runtime for a spec.
    pub async fn runtime(&self, spec: &ContainerSpec) -> Result<Arc<dyn ContainerRuntime>> {
        Ok(match spec.platform {
            Platform::Docker => {
                Arc::new(DockerRuntime::new(self.docker().await?, self.config.clone()))
            }
            Platform::Kubernetes => match spec.mode {
                ExecutionMode::Service => {
                    Arc::new(ServiceRuntime::new(self.kube().await?, self.config.clone()))
                }
                ExecutionMode::Task => {
                    Arc::new(JobRuntime::new(self.kube().await?, self.config.clone()))
                }
            },
        })
    }
}
