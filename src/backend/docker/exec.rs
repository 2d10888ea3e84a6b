//! Exec sessions and logs of application containers

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::LogsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::backend::{run_exec_session, ExecStreams};
use crate::error::{Error, Result};

/// Run `cmd` in `container` with `streams` attached
pub(super) async fn exec_in_container(
    docker: &Docker,
    container: &str,
    cmd: &[String],
    streams: ExecStreams,
) -> Result<()> {
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(false),
                cmd: Some(cmd.to_vec()),
                ..Default::default()
            },
        )
        .await?;

    let StartExecResults::Attached {
        mut output,
        mut input,
    } = docker.start_exec(&exec.id, None::<StartExecOptions>).await?
    else {
        return Err(Error::ExecError("exec session started detached".to_string()));
    };

    let ExecStreams {
        stdin,
        mut stdout,
        mut stderr,
    } = streams;

    let pump_output = async {
        while let Some(chunk) = output.next().await {
            match chunk.map_err(|e| Error::ExecError(format!("output: {e}")))? {
                LogOutput::StdErr { message } => stderr.write_all(&message).await?,
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.write_all(&message).await?
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        stdout.flush().await?;
        stderr.flush().await?;
        Ok::<(), Error>(())
    };

    let result = run_exec_session(stdin, &mut input, pump_output).await;
    debug!(container, "Exec session finished");
    result
}

/// Last `tail` lines of stdout and stderr
pub(super) async fn tail_logs(docker: &Docker, container: &str, tail: usize) -> Result<String> {
    let stream = docker.logs(
        container,
        Some(LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        }),
    );
    futures::pin_mut!(stream);
    let mut logs = String::new();
    while let Some(chunk) = stream.next().await {
        logs.push_str(&chunk?.to_string());
    }
    Ok(logs)
}
