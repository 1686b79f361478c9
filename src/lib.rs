//! Platform-agnostic container orchestration.
//!
//! One contract for describing, launching, inspecting, and tearing down a
//! container workload, executed against either a local Docker-compatible
//! daemon (through [bollard]) or a remote Kubernetes cluster (through
//! [kube]). A second responsibility is image construction: building an OCI
//! image from a context directory and pushing it to a registry, either on
//! the daemon or through an in-cluster Kaniko job.
//!
//! The usual flow is: assemble a [ContainerSpec] with its builder, wrap it
//! in a [Container] handle, ask a [RuntimeFactory] for the matching
//! [ContainerRuntime], and drive the handle through the runtime:
//!
//! ```no_run
//! use easycontainers::{Container, ContainerSpec, Platform, RuntimeConfig, RuntimeFactory};
//!
//! # async fn demo() -> easycontainers::Result<()> {
//! let spec = ContainerSpec::builder()
//!     .platform(Platform::Docker)
//!     .name("web")?
//!     .image("nginx:latest")?
//!     .exposed_port("http", 80)?
//!     .port_mapping(80, 38080)?
//!     .ephemeral(true)
//!     .build()?;
//!
//! let factory = RuntimeFactory::new(RuntimeConfig::default());
//! let container = Container::new(spec);
//! let runtime = factory.runtime(container.spec()).await?;
//! runtime.start(&container).await?;
//! // ... exec, file transfer, wait ...
//! runtime.stop(&container).await?;
//! runtime.delete(&container, false).await?;
//! # Ok(())
//! # }
//! ```

mod container;
mod error;
mod paths;
mod spec;
mod state;
mod tarball;
mod values;

/// The Docker daemon backend.
pub mod docker;
/// Image construction against the daemon or an in-cluster Kaniko job.
pub mod image;
/// The Kubernetes backend (Deployment+Service and Batch Job variants).
pub mod kubernetes;
mod runtime;

pub use container::Container;
pub use error::{Error, Result};
pub use spec::{
    ContainerFile, ContainerSpec, ContainerSpecBuilder, ExecutionMode, OutputLineFn, Platform,
    Volume, NATIVE_ENTRYPOINT_PROPERTY,
};
pub use image::{
    BuildState, DaemonImageBuilder, ImageBuildSpec, ImageBuildSpecBuilder, KanikoImageBuilder,
};
pub use state::ContainerState;
pub use values::{
    ContainerName, CpuMillis, ImageRef, K8sNamespace, MemorySize, NetworkMode, RemotePath,
};
pub use runtime::{ContainerRuntime, Execution, RuntimeConfig, RuntimeFactory};
