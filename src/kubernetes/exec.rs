use std::{
    io::Cursor,
    path::{Path, PathBuf},
    time::Duration,
};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    container::Container,
    error::{Error, Result},
    paths::{self, shell_quote},
    runtime::Execution,
    state::ContainerState,
    tarball,
    values::RemotePath,
};

/// Raw exec outcome before the runtime-facing shaping.
pub(crate) struct ExecOutcome {
    pub(crate) exit_code: Option<i64>,
    pub(crate) stderr: Vec<u8>,
}

/// Runs a command in the pod over the attach API.
///
/// stdin is pumped from the library side and shut down explicitly, the
/// strategy that holds up across client implementations. stdout goes to
/// the caller's sink, stderr into a private buffer. The whole call runs
/// under one shared budget; exceeding it is a timeout error.
pub(crate) async fn exec_in_pod(
    client: &kube::Client,
    namespace: &str,
    pod: &str,
    command: Vec<String>,
    input: Option<Vec<u8>>,
    output: &mut (dyn AsyncWrite + Send + Unpin),
    use_tty: bool,
    timeout: Option<Duration>,
) -> Result<ExecOutcome> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = AttachParams::default()
        .stdin(input.is_some())
        .stdout(true)
        .stderr(!use_tty)
        .tty(use_tty);

    let run = async {
        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .map_err(Error::from)?;
        let stdin = attached.stdin();
        let stdout = attached.stdout();
        let stderr_reader = attached.stderr();
        let status = attached.take_status();

        let write_input = async {
            if let Some(mut writer) = stdin {
                if let Some(bytes) = &input {
                    writer.write_all(bytes).await?;
                }
                writer.shutdown().await?;
            }
            Ok(()) as Result<()>
        };
        let drain_stdout = async {
            if let Some(mut reader) = stdout {
                tokio::io::copy(&mut reader, output).await?;
            }
            Ok(()) as Result<()>
        };
        let drain_stderr = async {
            let mut captured = Vec::new();
            if let Some(mut reader) = stderr_reader {
                tokio::io::copy(&mut reader, &mut Cursor::new(&mut captured)).await?;
            }
            Ok(captured) as Result<Vec<u8>>
        };
        let (_, _, stderr) = tokio::try_join!(write_input, drain_stdout, drain_stderr)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(err) = attached.join().await {
            tracing::debug!(pod, "exec channel closed uncleanly: {err}");
        }
        Ok(ExecOutcome {
            exit_code: exit_code_of(status)?,
            stderr,
        })
    };

    match timeout {
        Some(budget) => tokio::time::timeout(budget, run)
            .await
            .map_err(|_| Error::Timeout(budget))?,
        None => run.await,
    }
}

/// The exec subresource reports completion as a `Status` object; a
/// failure without an `ExitCode` cause is an infrastructure error, not a
/// process exit.
fn exit_code_of(
    status: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>,
) -> Result<Option<i64>> {
    let status = match status {
        Some(status) => status,
        None => return Ok(None),
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(Some(0));
    }
    let exit_code = status.details.as_ref().and_then(|details| {
        details.causes.as_ref().and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                .and_then(|cause| cause.message.as_deref()?.parse().ok())
        })
    });
    match exit_code {
        Some(code) => Ok(Some(code)),
        None => Err(Error::Backend(format!(
            "exec failed without exit code: {}",
            status.message.unwrap_or_default()
        ))),
    }
}

/// The runtime-facing execute: optional working directory handled by a
/// shell hop, since the exec subresource has no working-dir field.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute(
    client: &kube::Client,
    container: &Container,
    exec: &str,
    args: &[String],
    use_tty: bool,
    working_dir: Option<&RemotePath>,
    input: Option<Vec<u8>>,
    output: &mut (dyn AsyncWrite + Send + Unpin),
    timeout: Option<Duration>,
) -> Result<Execution> {
    container.require_state(ContainerState::Running)?;
    let pod = required_pod(container)?;
    let namespace = container.spec().namespace.to_string();

    let command = match working_dir {
        None => {
            let mut command = Vec::with_capacity(args.len() + 1);
            command.push(exec.to_owned());
            command.extend(args.iter().cloned());
            command
        }
        Some(dir) => {
            let mut script = format!("cd {} && exec {}", shell_quote(dir.as_str()), shell_quote(exec));
            for arg in args {
                script.push(' ');
                script.push_str(&shell_quote(arg));
            }
            vec!["sh".to_owned(), "-c".to_owned(), script]
        }
    };

    let outcome = exec_in_pod(
        client, &namespace, &pod, command, input, output, use_tty, timeout,
    )
    .await?;
    Ok(Execution {
        exit_code: outcome.exit_code,
        stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
    })
}

// File transfer is synthesized over exec, there is no native copy
// subresource. Every helper treats a non-zero exit or any stderr output
// as a failed transfer.

const TRANSFER_BUDGET: Duration = Duration::from_secs(300);

async fn run_transfer(
    client: &kube::Client,
    container: &Container,
    description: &str,
    script: String,
    input: Option<Vec<u8>>,
    output: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<()> {
    let pod = required_pod(container)?;
    let namespace = container.spec().namespace.to_string();
    let command = vec!["sh".to_owned(), "-c".to_owned(), script];
    let outcome = exec_in_pod(
        client,
        &namespace,
        &pod,
        command,
        input,
        output,
        false,
        Some(TRANSFER_BUDGET),
    )
    .await?;

    if !outcome.stderr.is_empty() {
        return Err(Error::Transfer(format!(
            "{description}: {}",
            String::from_utf8_lossy(&outcome.stderr).trim()
        )));
    }
    match outcome.exit_code {
        Some(0) => Ok(()),
        Some(code) => Err(Error::Transfer(format!(
            "{description} exited with {code}"
        ))),
        None => Err(Error::Transfer(format!(
            "{description} finished without an exit status"
        ))),
    }
}

pub(crate) async fn put_file(
    client: &kube::Client,
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
    let target = remote_dir.join(&remote_name);

    let script = format!(
        "mkdir -p {dir} && cat > {target}",
        dir = shell_quote(remote_dir.as_str()),
        target = shell_quote(target.as_str()),
    );
    let mut sink = tokio::io::sink();
    run_transfer(client, container, "uploading file", script, Some(content), &mut sink).await?;
    Ok(size)
}

pub(crate) async fn get_file(
    client: &kube::Client,
    container: &Container,
    remote_dir: &RemotePath,
    remote_name: &str,
    local: Option<&Path>,
) -> Result<PathBuf> {
    container.require_state(ContainerState::Running)?;
    let remote = remote_dir.join(remote_name);
    let script = format!("cat {}", shell_quote(remote.as_str()));

    let mut captured = Cursor::new(Vec::new());
    run_transfer(client, container, "downloading file", script, None, &mut captured).await?;

    let target = paths::resolve_download_target(local, remote_name)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, captured.into_inner()).await?;
    Ok(target)
}

pub(crate) async fn put_directory(
    client: &kube::Client,
    container: &Container,
    local: &Path,
    remote_dir: &RemotePath,
) -> Result<u64> {
    container.require_state(ContainerState::Running)?;
    let archive = tarball::directory_contents(local)?;
    let size = archive.len() as u64;

    let script = format!(
        "mkdir -p {dir} && tar -xf - -C {dir}",
        dir = shell_quote(remote_dir.as_str()),
    );
    let mut sink = tokio::io::sink();
    run_transfer(
        client,
        container,
        "uploading directory",
        script,
        Some(archive),
        &mut sink,
    )
    .await?;
    Ok(size)
}

pub(crate) async fn get_directory(
    client: &kube::Client,
    container: &Container,
    remote_dir: &RemotePath,
    local: &Path,
) -> Result<(PathBuf, Vec<PathBuf>)> {
    container.require_state(ContainerState::Running)?;
    let script = format!(
        "tar -cf - -C {parent} {base}",
        parent = shell_quote(remote_dir.parent().as_str()),
        base = shell_quote(remote_dir.file_name()),
    );

    let mut captured = Cursor::new(Vec::new());
    run_transfer(
        client,
        container,
        "downloading directory",
        script,
        None,
        &mut captured,
    )
    .await?;

    let files = tarball::extract_into(&captured.into_inner(), local)?;
    Ok((local.to_path_buf(), files))
}

fn required_pod(container: &Container) -> Result<String> {
    container
        .pod_name()
        .map(str::to_owned)
        .ok_or_else(|| Error::NotFound(format!("{} has no pod assigned", container.spec().name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusCause, StatusDetails};

    fn failure_with_exit(code: &str) -> Status {
        Status {
            status: Some("Failure".to_owned()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_owned()),
                    message: Some(code.to_owned()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn success_is_exit_zero() {
        let status = Status {
            status: Some("Success".to_owned()),
            ..Default::default()
        };
        assert_eq!(exit_code_of(Some(status)).unwrap(), Some(0));
    }

    #[test]
    fn failure_carries_the_exit_code() {
        assert_eq!(exit_code_of(Some(failure_with_exit("42"))).unwrap(), Some(42));
    }

    #[test]
    fn missing_status_is_unknown() {
        assert_eq!(exit_code_of(None).unwrap(), None);
    }

    #[test]
    fn failure_without_exit_code_is_backend_error() {
        let status = Status {
            status: Some("Failure".to_owned()),
            message: Some("pod gone".to_owned()),
            ..Default::default()
        };
        assert!(matches!(exit_code_of(Some(status)), Err(Error::Backend(_))));
    }
}
