use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    values::{
        check_env_key, check_env_value, check_port, ContainerName, CpuMillis, ImageRef,
        K8sNamespace, MemorySize, NetworkMode, RemotePath,
    },
};

/// Which backend realizes the workload.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Docker,
    Kubernetes,
}

/// Whether the workload is a long-running service or a run-to-completion
/// task. On Kubernetes this selects Deployment+Service versus Batch Job;
/// the Docker backend treats both the same apart from completion waits.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Service,
    Task,
}

/// Callback receiving each output line of the container, in arrival order.
pub type OutputLineFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Custom property key: when set to `"true"` the Docker backend passes
/// command and arguments through natively instead of wrapping them in
/// `/bin/sh -c`.
pub const NATIVE_ENTRYPOINT_PROPERTY: &str = "native-entrypoint";

/// A volume attached to the container.
///
/// Non-memory volumes resolve to a pre-existing named volume (Docker) or a
/// `<name>-pvc` PersistentVolumeClaim (Kubernetes); a `host_dir` makes it a
/// bind mount on Docker. Memory-backed volumes become tmpfs / memory
/// `emptyDir` mounts and must not carry a `host_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub mount_dir: RemotePath,
    pub host_dir: Option<PathBuf>,
    pub memory_backed: bool,
    pub memory: Option<MemorySize>,
}

impl Volume {
    /// A named volume (Docker) or `<name>-pvc` claim (Kubernetes).
    pub fn named(name: impl Into<String>, mount_dir: RemotePath) -> Self {
        Self {
            name: name.into(),
            mount_dir,
            host_dir: None,
            memory_backed: false,
            memory: None,
        }
    }

    /// A host directory bind mount (Docker only).
    pub fn host(name: impl Into<String>, host_dir: impl Into<PathBuf>, mount_dir: RemotePath) -> Self {
        Self {
            name: name.into(),
            mount_dir,
            host_dir: Some(host_dir.into()),
            memory_backed: false,
            memory: None,
        }
    }

    /// A memory-backed mount of the given size.
    pub fn memory(name: impl Into<String>, mount_dir: RemotePath, size: MemorySize) -> Self {
        Self {
            name: name.into(),
            mount_dir,
            host_dir: None,
            memory_backed: true,
            memory: Some(size),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("volume", "name must not be empty"));
        }
        if self.memory_backed && self.host_dir.is_some() {
            return Err(Error::validation(
                "volume",
                format!("{:?} is memory backed and cannot bind a host directory", self.name),
            ));
        }
        Ok(())
    }
}

/// A single file materialized inside the container: a ConfigMap entry
/// mounted via `subPath` on Kubernetes, a one-file bind mount on Docker.
/// Either inline `content` or a `host_file` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerFile {
    pub name: String,
    pub mount_path: RemotePath,
    pub content: Option<String>,
    pub host_file: Option<PathBuf>,
}

impl ContainerFile {
    pub fn inline(name: impl Into<String>, mount_path: RemotePath, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path,
            content: Some(content.into()),
            host_file: None,
        }
    }

    pub fn from_host(name: impl Into<String>, mount_path: RemotePath, host_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mount_path,
            content: None,
            host_file: Some(host_file.into()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("container file", "name must not be empty"));
        }
        if self.content.is_none() && self.host_file.is_none() {
            return Err(Error::validation(
                "container file",
                format!("{:?} needs content or a host file", self.name),
            ));
        }
        Ok(())
    }
}

/// The immutable description of one container workload, fed to a runtime.
/// Assemble it through [ContainerSpec::builder]; every identifier-carrying
/// field is validated at [ContainerSpecBuilder::build] time.
#[derive(Clone)]
pub struct ContainerSpec {
    pub platform: Platform,
    pub mode: ExecutionMode,
    pub name: ContainerName,
    pub namespace: K8sNamespace,
    pub image: ImageRef,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// A single executable path; arguments go in `args`.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Symbolic name to container-side TCP port.
    pub exposed_ports: BTreeMap<String, u16>,
    /// Container-side port to host-side port.
    pub port_mappings: BTreeMap<u16, u16>,
    pub network: Option<NetworkMode>,
    pub cpu_request: Option<CpuMillis>,
    pub cpu_limit: Option<CpuMillis>,
    pub memory_request: Option<MemorySize>,
    pub memory_limit: Option<MemorySize>,
    /// Remove the backend resource immediately on exit.
    pub ephemeral: bool,
    pub max_life_time: Option<Duration>,
    pub volumes: Vec<Volume>,
    pub container_files: Vec<ContainerFile>,
    pub output_line: Option<OutputLineFn>,
    /// Backend tuning knobs, see [NATIVE_ENTRYPOINT_PROPERTY].
    pub custom_properties: BTreeMap<String, String>,
}

// the output callback has no useful Debug
impl std::fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("platform", &self.platform)
            .field("mode", &self.mode)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("image", &self.image)
            .field("env", &self.env)
            .field("labels", &self.labels)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("exposed_ports", &self.exposed_ports)
            .field("port_mappings", &self.port_mappings)
            .field("network", &self.network)
            .field("ephemeral", &self.ephemeral)
            .field("max_life_time", &self.max_life_time)
            .field("volumes", &self.volumes)
            .field("container_files", &self.container_files)
            .field("output_line", &self.output_line.as_ref().map(|_| "<fn>"))
            .field("custom_properties", &self.custom_properties)
            .finish_non_exhaustive()
    }
}

impl ContainerSpec {
    pub fn builder() -> ContainerSpecBuilder {
        ContainerSpecBuilder::default()
    }

    /// Whether a custom property is set to `"true"`.
    pub fn property_enabled(&self, key: &str) -> bool {
        self.custom_properties.get(key).map(String::as_str) == Some("true")
    }

    /// Delivers one output line to the configured callback, if any.
    pub(crate) fn emit_line(&self, line: &str) {
        if let Some(callback) = &self.output_line {
            callback(line);
        }
    }
}

/// Fluent assembly of a [ContainerSpec]. Identifier arguments are validated
/// on the way in so errors point at the offending call; cross-field
/// invariants are checked in [build](Self::build).
#[derive(Default)]
pub struct ContainerSpecBuilder {
    platform: Option<Platform>,
    mode: Option<ExecutionMode>,
    name: Option<ContainerName>,
    namespace: Option<K8sNamespace>,
    image: Option<ImageRef>,
    env: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    command: Option<String>,
    args: Vec<String>,
    exposed_ports: BTreeMap<String, u16>,
    port_mappings: BTreeMap<u16, u16>,
    network: Option<NetworkMode>,
    cpu_request: Option<CpuMillis>,
    cpu_limit: Option<CpuMillis>,
    memory_request: Option<MemorySize>,
    memory_limit: Option<MemorySize>,
    ephemeral: bool,
    max_life_time: Option<Duration>,
    volumes: Vec<Volume>,
    container_files: Vec<ContainerFile>,
    output_line: Option<OutputLineFn>,
    custom_properties: BTreeMap<String, String>,
}

impl ContainerSpecBuilder {
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn name(mut self, name: impl AsRef<str>) -> Result<Self> {
        self.name = Some(ContainerName::new(name)?);
        Ok(self)
    }

    pub fn namespace(mut self, namespace: impl AsRef<str>) -> Result<Self> {
        self.namespace = Some(K8sNamespace::new(namespace)?);
        Ok(self)
    }

    pub fn image(mut self, reference: impl AsRef<str>) -> Result<Self> {
        self.image = Some(ImageRef::parse(reference)?);
        Ok(self)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let (key, value) = (key.into(), value.into());
        check_env_key(&key)?;
        check_env_value(&key, &value)?;
        self.env.insert(key, value);
        Ok(self)
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(Error::validation("command", "must not be empty"));
        }
        self.command = Some(command);
        Ok(self)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn exposed_port(mut self, symbol: impl Into<String>, port: u16) -> Result<Self> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(Error::validation("exposed port", "symbolic name must not be empty"));
        }
        let port = check_port("exposed port", port)?;
        self.exposed_ports.insert(symbol, port);
        Ok(self)
    }

    pub fn port_mapping(mut self, container_port: u16, host_port: u16) -> Result<Self> {
        let container_port = check_port("port mapping", container_port)?;
        let host_port = check_port("port mapping", host_port)?;
        self.port_mappings.insert(container_port, host_port);
        Ok(self)
    }

    pub fn network(mut self, network: impl AsRef<str>) -> Result<Self> {
        self.network = Some(NetworkMode::parse(network)?);
        Ok(self)
    }

    pub fn cpu_request(mut self, cpu: CpuMillis) -> Self {
        self.cpu_request = Some(cpu);
        self
    }

    pub fn cpu_limit(mut self, cpu: CpuMillis) -> Self {
        self.cpu_limit = Some(cpu);
        self
    }

    pub fn memory_request(mut self, memory: MemorySize) -> Self {
        self.memory_request = Some(memory);
        self
    }

    pub fn memory_limit(mut self, memory: MemorySize) -> Self {
        self.memory_limit = Some(memory);
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn max_life_time(mut self, max_life_time: Duration) -> Self {
        self.max_life_time = Some(max_life_time);
        self
    }

    pub fn volume(mut self, volume: Volume) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn container_file(mut self, file: ContainerFile) -> Self {
        self.container_files.push(file);
        self
    }

    /// Install the line callback receiving container output.
    pub fn output_line(mut self, callback: OutputLineFn) -> Self {
        self.output_line = Some(callback);
        self
    }

    pub fn custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<ContainerSpec> {
        let name = self
            .name
            .ok_or_else(|| Error::validation("container name", "is required"))?;
        let image = self
            .image
            .ok_or_else(|| Error::validation("image", "is required"))?;
        for volume in &self.volumes {
            volume.validate()?;
        }
        for file in &self.container_files {
            file.validate()?;
        }
        if self.command.is_none() && !self.args.is_empty() {
            return Err(Error::validation("command", "arguments given without a command"));
        }
        Ok(ContainerSpec {
            platform: self.platform.unwrap_or(Platform::Docker),
            mode: self.mode.unwrap_or(ExecutionMode::Service),
            name,
            namespace: self.namespace.unwrap_or_default(),
            image,
            env: self.env,
            labels: self.labels,
            command: self.command,
            args: self.args,
            exposed_ports: self.exposed_ports,
            port_mappings: self.port_mappings,
            network: self.network,
            cpu_request: self.cpu_request,
            cpu_limit: self.cpu_limit,
            memory_request: self.memory_request,
            memory_limit: self.memory_limit,
            ephemeral: self.ephemeral,
            max_life_time: self.max_life_time,
            volumes: self.volumes,
            container_files: self.container_files,
            output_line: self.output_line,
            custom_properties: self.custom_properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ContainerSpecBuilder {
        ContainerSpec::builder()
            .platform(Platform::Docker)
            .name("unit")
            .unwrap()
            .image("busybox:1.36")
            .unwrap()
    }

    #[test]
    fn builds_with_defaults() {
        let spec = minimal().build().unwrap();
        assert_eq!(spec.namespace.as_str(), "default");
        assert!(matches!(spec.mode, ExecutionMode::Service));
        assert!(!spec.ephemeral);
        assert!(spec.command.is_none());
    }

    #[test]
    fn requires_name_and_image() {
        assert!(ContainerSpec::builder().build().is_err());
        let err = ContainerSpec::builder()
            .name("x")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "image", .. }));
    }

    #[test]
    fn rejects_bad_identifiers() {
        assert!(minimal().env("2bad", "v").is_err());
        assert!(minimal().env("GOOD", "bad\nvalue").is_err());
        assert!(minimal().exposed_port("http", 0).is_err());
        assert!(minimal().port_mapping(80, 0).is_err());
        assert!(minimal().command("  ").is_err());
        assert!(ContainerSpec::builder().name("Not-Valid").is_err());
    }

    #[test]
    fn rejects_args_without_command() {
        let err = minimal().arg("-la").build().unwrap_err();
        assert!(matches!(err, Error::Validation { field: "command", .. }));
    }

    #[test]
    fn volume_invariants() {
        let mount = RemotePath::new("/data").unwrap();
        let mut volume = Volume::memory("cache", mount, MemorySize::from_bytes(1 << 20));
        volume.host_dir = Some(PathBuf::from("/tmp/cache"));
        let err = minimal().volume(volume).build().unwrap_err();
        assert!(matches!(err, Error::Validation { field: "volume", .. }));
    }

    #[test]
    fn container_file_needs_a_source() {
        let mount = RemotePath::new("/etc/app/app.conf").unwrap();
        let file = ContainerFile {
            name: "app.conf".to_owned(),
            mount_path: mount,
            content: None,
            host_file: None,
        };
        assert!(minimal().container_file(file).build().is_err());
    }

    #[test]
    fn custom_properties_gate() {
        let spec = minimal()
            .custom_property(NATIVE_ENTRYPOINT_PROPERTY, "true")
            .build()
            .unwrap();
        assert!(spec.property_enabled(NATIVE_ENTRYPOINT_PROPERTY));
        assert!(!spec.property_enabled("other"));
    }
}
