mod archive;
mod exec;
mod runtime;
mod stream;

pub use runtime::DockerRuntime;

use crate::{
    error::{Error, Result},
    runtime::RuntimeConfig,
};

/// Connects to the daemon. An explicit `docker_host` in the config wins;
/// otherwise bollard honors `DOCKER_HOST` and falls back to the platform
/// default socket.
pub(crate) async fn connect(config: &RuntimeConfig) -> Result<bollard::Docker> {
    let docker = match config.docker_host.as_deref() {
        Some(host) if host.starts_with("unix://") => bollard::Docker::connect_with_unix(
            host,
            120,
            bollard::API_DEFAULT_VERSION,
        ),
        Some(host) => bollard::Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
        None => bollard::Docker::connect_with_defaults(),
    }
    .map_err(Error::from)?;
    // fail fast on an unreachable daemon instead of at first use
    docker.ping().await.map_err(Error::from)?;
    Ok(docker)
}
