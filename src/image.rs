mod daemon;
mod kaniko;

use std::{collections::BTreeMap, path::PathBuf};

use tokio::sync::watch;

pub use daemon::DaemonImageBuilder;
pub use kaniko::KanikoImageBuilder;

use crate::{
    error::{Error, Result},
    spec::OutputLineFn,
    values::{ContainerName, K8sNamespace},
};

/// The build lifecycle, shared by both builder variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Unknown,
}

impl BuildState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::NotStarted, Self::InProgress) => true,
            (Self::InProgress, Self::Completed | Self::Failed | Self::Unknown) => true,
            (Self::Unknown, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BuildStateCell {
    tx: watch::Sender<BuildState>,
}

impl BuildStateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(BuildState::NotStarted);
        Self { tx }
    }

    pub(crate) fn get(&self) -> BuildState {
        *self.tx.borrow()
    }

    pub(crate) fn transition(&self, next: BuildState) {
        self.tx.send_if_modified(|current| {
            if *current != next && current.can_transition_to(next) {
                tracing::debug!(from = ?current, to = ?next, "build state transition");
                *current = next;
                true
            } else if *current != next {
                tracing::warn!(from = ?current, to = ?next, "illegal build transition dropped");
                false
            } else {
                false
            }
        });
    }
}

/// What to build and where to push it. The same spec drives the daemon
/// builder and the Kaniko builder.
#[derive(Clone)]
pub struct ImageBuildSpec {
    /// Directory holding the build context; a `Dockerfile` must exist at
    /// its root.
    pub context_dir: PathBuf,
    /// Target registry, `host[:port]`.
    pub registry: String,
    pub repository: Option<String>,
    pub name: ContainerName,
    /// Every tag becomes one pushed destination.
    pub tags: Vec<String>,
    /// Push over plain HTTP and declare the registry insecure to Kaniko.
    pub insecure_registry: bool,
    /// Namespace the Kaniko job runs in.
    pub namespace: K8sNamespace,
    /// Kaniko log verbosity.
    pub verbosity: String,
    pub labels: BTreeMap<String, String>,
    /// Receives build output lines.
    pub output_line: Option<OutputLineFn>,
}

impl std::fmt::Debug for ImageBuildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuildSpec")
            .field("context_dir", &self.context_dir)
            .field("registry", &self.registry)
            .field("repository", &self.repository)
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("insecure_registry", &self.insecure_registry)
            .field("namespace", &self.namespace)
            .field("verbosity", &self.verbosity)
            .finish_non_exhaustive()
    }
}

impl ImageBuildSpec {
    pub fn builder() -> ImageBuildSpecBuilder {
        ImageBuildSpecBuilder::default()
    }

    /// One full `registry/[repository/]name:tag` reference per tag.
    pub fn destinations(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{tag}", self.repository_path()))
            .collect()
    }

    /// The push target without a tag.
    pub fn repository_path(&self) -> String {
        match &self.repository {
            Some(repository) => format!("{}/{repository}/{}", self.registry, self.name),
            None => format!("{}/{}", self.registry, self.name),
        }
    }

    pub(crate) fn emit_line(&self, line: &str) {
        if let Some(callback) = &self.output_line {
            callback(line);
        }
    }
}

#[derive(Default)]
pub struct ImageBuildSpecBuilder {
    context_dir: Option<PathBuf>,
    registry: Option<String>,
    repository: Option<String>,
    name: Option<ContainerName>,
    tags: Vec<String>,
    insecure_registry: bool,
    namespace: Option<K8sNamespace>,
    verbosity: Option<String>,
    labels: BTreeMap<String, String>,
    output_line: Option<OutputLineFn>,
}

impl ImageBuildSpecBuilder {
    pub fn context_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = Some(dir.into());
        self
    }

    pub fn registry(mut self, registry: impl Into<String>) -> Result<Self> {
        let registry = registry.into();
        if registry.is_empty() {
            return Err(Error::validation("registry", "must not be empty"));
        }
        self.registry = Some(registry);
        Ok(self)
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn name(mut self, name: impl AsRef<str>) -> Result<Self> {
        self.name = Some(ContainerName::new(name)?);
        Ok(self)
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        if tag.is_empty() || tag.contains([':', '/']) {
            return Err(Error::validation("tag", format!("{tag:?} is not a tag")));
        }
        self.tags.push(tag);
        Ok(self)
    }

    pub fn insecure_registry(mut self, insecure: bool) -> Self {
        self.insecure_registry = insecure;
        self
    }

    pub fn namespace(mut self, namespace: impl AsRef<str>) -> Result<Self> {
        self.namespace = Some(K8sNamespace::new(namespace)?);
        Ok(self)
    }

    pub fn verbosity(mut self, verbosity: impl Into<String>) -> Self {
        self.verbosity = Some(verbosity.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn output_line(mut self, callback: OutputLineFn) -> Self {
        self.output_line = Some(callback);
        self
    }

    pub fn build(self) -> Result<ImageBuildSpec> {
        let context_dir = self
            .context_dir
            .ok_or_else(|| Error::validation("context dir", "is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| Error::validation("registry", "is required"))?;
        let name = self
            .name
            .ok_or_else(|| Error::validation("image name", "is required"))?;
        let tags = if self.tags.is_empty() {
            vec!["latest".to_owned()]
        } else {
            self.tags
        };
        Ok(ImageBuildSpec {
            context_dir,
            registry,
            repository: self.repository,
            name,
            tags,
            insecure_registry: self.insecure_registry,
            namespace: self.namespace.unwrap_or_default(),
            verbosity: self.verbosity.unwrap_or_else(|| "info".to_owned()),
            labels: self.labels,
            output_line: self.output_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_cover_every_tag() {
        let spec = ImageBuildSpec::builder()
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
            .build()
            .unwrap();
        assert_eq!(
            spec.destinations(),
            vec![
                "registry.local:5000/acme/tools:v1".to_owned(),
                "registry.local:5000/acme/tools:latest".to_owned(),
            ]
        );
    }

    #[test]
    fn defaults_to_latest_tag() {
        let spec = ImageBuildSpec::builder()
            .context_dir("/tmp/ctx")
            .registry("registry.local")
            .unwrap()
            .name("app")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(spec.tags, vec!["latest".to_owned()]);
        assert_eq!(spec.repository_path(), "registry.local/app");
    }

    #[test]
    fn rejects_malformed_tags() {
        let builder = ImageBuildSpec::builder();
        assert!(builder.tag("v1:bad").is_err());
        assert!(ImageBuildSpec::builder().tag("").is_err());
        assert!(ImageBuildSpec::builder().tag("a/b").is_err());
    }

    #[test]
    fn build_states_follow_the_graph() {
        let cell = BuildStateCell::new();
        assert_eq!(cell.get(), BuildState::NotStarted);
        // cannot complete what never started
        cell.transition(BuildState::Completed);
        assert_eq!(cell.get(), BuildState::NotStarted);

        cell.transition(BuildState::InProgress);
        cell.transition(BuildState::Unknown);
        cell.transition(BuildState::Failed);
        assert_eq!(cell.get(), BuildState::Failed);
        assert!(cell.get().is_finished());
        cell.transition(BuildState::InProgress);
        assert_eq!(cell.get(), BuildState::Failed);
    }
}
