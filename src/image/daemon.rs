use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PushImageOptions, TagImageOptions};
use futures::StreamExt;

use crate::{
    error::{Error, Result},
    image::{BuildState, BuildStateCell, ImageBuildSpec},
    tarball,
};

/// Builds on the local daemon and pushes every tag to its registry.
/// Push credentials come from `DOCKER_USERNAME`/`DOCKER_PASSWORD` when
/// present, anonymous otherwise.
pub struct DaemonImageBuilder {
    docker: bollard::Docker,
    spec: ImageBuildSpec,
    state: BuildStateCell,
}

impl DaemonImageBuilder {
    pub fn new(docker: bollard::Docker, spec: ImageBuildSpec) -> Self {
        Self {
            docker,
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
        if !self.spec.context_dir.join("Dockerfile").is_file() {
            return Err(Error::Build(format!(
                "no Dockerfile in context {}",
                self.spec.context_dir.display()
            )));
        }
        let context = tarball::directory_contents(&self.spec.context_dir)?;
        let destinations = self.spec.destinations();
        let primary = destinations[0].clone();

        tracing::info!(destination = %primary, "building image on daemon");
        let mut progress = self.docker.build_image(
            BuildImageOptions::<String> {
                dockerfile: "Dockerfile".to_owned(),
                t: primary.clone(),
                rm: true,
                labels: self.spec.labels.clone().into_iter().collect(),
                ..Default::default()
            },
            None,
            Some(context.into()),
        );
        while let Some(update) = progress.next().await {
            let update = update.map_err(Error::from)?;
            if let Some(line) = update.stream.as_deref() {
                let line = line.trim_end();
                if !line.is_empty() {
                    self.spec.emit_line(line);
                }
            }
            if let Some(message) = update.error {
                return Err(Error::Build(message));
            }
        }

        // the daemon built only the primary reference; alias the rest
        let repository = self.spec.repository_path();
        for tag in &self.spec.tags[1..] {
            self.docker
                .tag_image(
                    &primary,
                    Some(TagImageOptions {
                        repo: repository.clone(),
                        tag: tag.clone(),
                    }),
                )
                .await
                .map_err(Error::from)?;
        }

        for tag in &self.spec.tags {
            self.push(tag).await?;
        }
        Ok(())
    }

    async fn push(&self, tag: &str) -> Result<()> {
        let repository = self.spec.repository_path();
        tracing::info!(image = %repository, tag, "pushing");
        let mut progress = self.docker.push_image(
            &repository,
            Some(PushImageOptions { tag }),
            ambient_credentials(&self.spec.registry),
        );
        while let Some(update) = progress.next().await {
            let update = update.map_err(Error::from)?;
            if let Some(message) = update.error {
                return Err(Error::Build(format!("push of {repository}:{tag}: {message}")));
            }
            if let Some(status) = update.status.as_deref() {
                tracing::debug!(tag, "{status}");
            }
        }
        Ok(())
    }
}

fn ambient_credentials(registry: &str) -> Option<DockerCredentials> {
    let username = std::env::var("DOCKER_USERNAME").ok()?;
    Some(DockerCredentials {
        username: Some(username),
        password: std::env::var("DOCKER_PASSWORD").ok(),
        serveraddress: Some(registry.to_owned()),
        ..Default::default()
    })
}
