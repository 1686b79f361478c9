use std::path::{Path, PathBuf};

use futures::StreamExt;

use crate::{
    container::Container,
    docker::exec,
    error::{Error, Result},
    paths, state::ContainerState,
    tarball,
    values::RemotePath,
};

// Tar archives over the daemon's copy endpoints are the only file
// transfer channel; the remote directory is created up front so the
// upload cannot land in a nonexistent path.

pub(crate) async fn put_file(
    docker: &bollard::Docker,
    container: &Container,
    local: &Path,
    remote_dir: &RemotePath,
    remote_name: Option<&str>,
) -> Result<u64> {
    container.require_state(ContainerState::Running)?;
    let remote_name = match remote_name {
        Some(name) => name.to_owned(),
        None => local
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::Transfer(format!("{} has no usable file name", local.display()))
            })?,
    };

    let content = tokio::fs::read(local).await?;
    let size = content.len() as u64;
    let archive = tarball::single_file(&remote_name, &content, 0o644)?;

    ensure_remote_dir(docker, container, remote_dir).await?;
    docker
        .upload_to_container(
            container.spec().name.as_str(),
            Some(bollard::container::UploadToContainerOptions {
                path: remote_dir.as_str().to_owned(),
                ..Default::default()
            }),
            archive.into(),
        )
        .await
        .map_err(Error::from)?;
    Ok(size)
}

pub(crate) async fn get_file(
    docker: &bollard::Docker,
    container: &Container,
    remote_dir: &RemotePath,
    remote_name: &str,
    local: Option<&Path>,
) -> Result<PathBuf> {
    container.require_state(ContainerState::Running)?;
    let archive = download(docker, container, &remote_dir.join(remote_name)).await?;
    let content = tarball::first_file(&archive)?;

    let target = paths::resolve_download_target(local, remote_name)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, content).await?;
    Ok(target)
}

pub(crate) async fn put_directory(
    docker: &bollard::Docker,
    container: &Container,
    local: &Path,
    remote_dir: &RemotePath,
) -> Result<u64> {
    container.require_state(ContainerState::Running)?;
    let archive = tarball::directory_contents(local)?;
    let size = archive.len() as u64;

    ensure_remote_dir(docker, container, remote_dir).await?;
    docker
        .upload_to_container(
            container.spec().name.as_str(),
            Some(bollard::container::UploadToContainerOptions {
                path: remote_dir.as_str().to_owned(),
                ..Default::default()
            }),
            archive.into(),
        )
        .await
        .map_err(Error::from)?;
    Ok(size)
}

pub(crate) async fn get_directory(
    docker: &bollard::Docker,
    container: &Container,
    remote_dir: &RemotePath,
    local: &Path,
) -> Result<(PathBuf, Vec<PathBuf>)> {
    container.require_state(ContainerState::Running)?;
    let archive = download(docker, container, remote_dir).await?;
    let files = tarball::extract_into(&archive, local)?;
    Ok((local.to_path_buf(), files))
}

async fn ensure_remote_dir(
    docker: &bollard::Docker,
    container: &Container,
    remote_dir: &RemotePath,
) -> Result<()> {
    exec::run_checked(
        docker,
        container,
        "creating remote directory",
        "mkdir",
        &["-p".to_owned(), remote_dir.as_str().to_owned()],
    )
    .await
}

/// Fetches the archive the daemon builds for a remote path; works for a
/// single file and for a directory tree alike.
async fn download(
    docker: &bollard::Docker,
    container: &Container,
    remote: &RemotePath,
) -> Result<Vec<u8>> {
    let mut stream = docker.download_from_container(
        container.spec().name.as_str(),
        Some(bollard::container::DownloadFromContainerOptions {
            path: remote.as_str().to_owned(),
        }),
    );
    let mut archive = Vec::new();
    while let Some(chunk) = stream.next().await {
        archive.extend_from_slice(&chunk.map_err(Error::from)?);
    }
    Ok(archive)
}
