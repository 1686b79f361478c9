use std::time::Duration;

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    container::Container,
    error::{Error, Result},
    runtime::Execution,
    state::ContainerState,
    values::RemotePath,
};

/// Runs a process in the container through the daemon's exec API.
///
/// stdout frames go to the caller's sink; stderr frames are captured
/// privately and returned as text, the streams are never merged. On
/// timeout the exec stream is dropped and a `None` exit code returned.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute(
    docker: &bollard::Docker,
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
    let name = container.spec().name.as_str();

    let mut cmd = Vec::with_capacity(args.len() + 1);
    cmd.push(exec.to_owned());
    cmd.extend(args.iter().cloned());

    let created = docker
        .create_exec(
            name,
            CreateExecOptions::<String> {
                attach_stdin: Some(input.is_some()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(use_tty),
                working_dir: working_dir.map(|dir| dir.as_str().to_owned()),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await
        .map_err(Error::from)?;

    let started = docker
        .start_exec(&created.id, None)
        .await
        .map_err(Error::from)?;
    let (mut frames, mut stdin) = match started {
        StartExecResults::Attached { output, input } => (output, input),
        StartExecResults::Detached => {
            return Ok(Execution {
                exit_code: Some(0),
                stderr: String::new(),
            })
        }
    };

    if let Some(bytes) = input {
        stdin.write_all(&bytes).await?;
        stdin.shutdown().await?;
    }
    drop(stdin);

    let mut stderr = Vec::new();
    let pump = async {
        while let Some(frame) = frames.next().await {
            match frame.map_err(Error::from)? {
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    output.write_all(&message).await?;
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        output.flush().await?;
        Ok(()) as Result<()>
    };

    let completed = match timeout {
        Some(budget) => match tokio::time::timeout(budget, pump).await {
            Ok(result) => {
                result?;
                true
            }
            Err(_) => false,
        },
        None => {
            pump.await?;
            true
        }
    };
    if !completed {
        // dropping `frames` closes the exec connection
        tracing::debug!(container.name = %name, exec, "exec timed out");
        return Ok(Execution {
            exit_code: None,
            stderr: String::new(),
        });
    }

    let inspected = docker.inspect_exec(&created.id).await.map_err(Error::from)?;
    Ok(Execution {
        exit_code: inspected.exit_code,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Runs a short helper command where any failure, non-zero exit, or
/// stderr output aborts a file transfer.
pub(crate) async fn run_checked(
    docker: &bollard::Docker,
    container: &Container,
    description: &str,
    exec: &str,
    args: &[String],
) -> Result<()> {
    let mut sink = tokio::io::sink();
    let outcome = execute(
        docker,
        container,
        exec,
        args,
        false,
        None,
        None,
        &mut sink,
        Some(Duration::from_secs(30)),
    )
    .await?;
    match outcome.exit_code {
        Some(0) if outcome.stderr.is_empty() => Ok(()),
        Some(code) => Err(Error::Transfer(format!(
            "{description} exited with {code}: {}",
            outcome.stderr.trim()
        ))),
        None => Err(Error::Transfer(format!("{description} timed out"))),
    }
}
