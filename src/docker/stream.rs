use std::time::SystemTime;

use bollard::container::LogOutput;
use futures::StreamExt;

use crate::{container::Container, state::ContainerState};

/// Accumulates stream frames and emits complete lines; frames can split a
/// line at any byte.
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8], mut emit: impl FnMut(&str)) {
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            emit(&String::from_utf8_lossy(&line));
        }
    }

    /// Hands out a trailing line that never got its newline.
    pub(crate) fn flush(&mut self, mut emit: impl FnMut(&str)) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            emit(&String::from_utf8_lossy(&line));
        }
    }
}

/// One subscriber task per container: follows the daemon log stream,
/// delivers lines to the output callback in arrival order, and on stream
/// end records the exit and finishes the lifecycle.
pub(crate) fn spawn_log_subscriber(docker: bollard::Docker, container: Container) {
    let cancel = container.cancel_token();
    tokio::spawn(async move {
        let name = container.spec().name.as_str().to_owned();
        let mut stream = docker.logs(
            &name,
            Some(bollard::container::LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "all".to_owned(),
                ..Default::default()
            }),
        );

        // stdout and stderr get separate buffers so a split line of one
        // stream cannot interleave into the other
        let mut stdout_lines = LineBuffer::new();
        let mut stderr_lines = LineBuffer::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(container.name = %name, "log subscriber cancelled");
                    return;
                }
                frame = stream.next() => match frame {
                    Some(Ok(LogOutput::StdErr { message })) => {
                        stderr_lines.push(&message, |line| container.spec().emit_line(line));
                    }
                    Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                        stdout_lines.push(&message, |line| container.spec().emit_line(line));
                    }
                    Some(Ok(LogOutput::StdIn { .. })) => {}
                    Some(Err(err)) => {
                        tracing::warn!(container.name = %name, "log stream failed: {err}");
                        if !container.state().is_completed() {
                            container.transition(ContainerState::Failed);
                        }
                        return;
                    }
                    None => break,
                }
            }
        }
        stdout_lines.flush(|line| container.spec().emit_line(line));
        stderr_lines.flush(|line| container.spec().emit_line(line));

        finalize(&docker, &container).await;
    });
}

/// The stream closed: the container exited. Inspect once more for the
/// exit code, transition to stopped, and clean up ephemeral leftovers.
async fn finalize(docker: &bollard::Docker, container: &Container) {
    let name = container.spec().name.as_str();

    match docker.inspect_container(name, None).await {
        Ok(inspected) => {
            if let Some(state) = inspected.state {
                if let Some(code) = state.exit_code {
                    container.set_exit_code(code);
                }
                if let Some(finished) = state
                    .finished_at
                    .as_deref()
                    .and_then(parse_backend_timestamp)
                {
                    container.set_finished_at(finished);
                }
            }
        }
        // an ephemeral container may already be auto-removed
        Err(err) => tracing::debug!(container.name = %name, "post-exit inspect failed: {err}"),
    }
    container.mark_finished();
    container.transition(ContainerState::Stopped);

    if container.spec().ephemeral {
        if let Some(network) = container.network_name() {
            if let Err(err) = docker.remove_network(network).await {
                tracing::warn!(network, "removing container network failed: {err}");
            }
        }
        container.transition(ContainerState::Deleted);
    }
}

fn parse_backend_timestamp(value: &str) -> Option<SystemTime> {
    // the daemon reports zero times for still-missing values
    if value.is_empty() || value.starts_with("0001-") {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(SystemTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buffer: &mut LineBuffer, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        buffer.push(chunk, |line| lines.push(line.to_owned()));
        lines
    }

    #[test]
    fn reassembles_split_lines() {
        let mut buffer = LineBuffer::new();
        assert!(collect(&mut buffer, b"hel").is_empty());
        assert_eq!(collect(&mut buffer, b"lo\nwor"), vec!["hello"]);
        assert_eq!(collect(&mut buffer, b"ld\n"), vec!["world"]);
    }

    #[test]
    fn handles_multiple_lines_per_frame() {
        let mut buffer = LineBuffer::new();
        assert_eq!(collect(&mut buffer, b"a\nb\nc\n"), vec!["a", "b", "c"]);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buffer = LineBuffer::new();
        assert_eq!(collect(&mut buffer, b"dos line\r\n"), vec!["dos line"]);
    }

    #[test]
    fn flush_emits_unterminated_tail() {
        let mut buffer = LineBuffer::new();
        collect(&mut buffer, b"no newline");
        let mut lines = Vec::new();
        buffer.flush(|line| lines.push(line.to_owned()));
        assert_eq!(lines, vec!["no newline"]);
    }

    #[test]
    fn backend_timestamps() {
        assert!(parse_backend_timestamp("2026-03-01T10:30:00.000000000Z").is_some());
        assert!(parse_backend_timestamp("0001-01-01T00:00:00Z").is_none());
        assert!(parse_backend_timestamp("").is_none());
    }
}
