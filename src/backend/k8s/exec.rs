//! Exec sessions and logs of application pods

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, LogParams};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::backend::{run_exec_session, ExecStreams};
use crate::error::{Error, Result};

/// Attach `streams` to `cmd` running in `container` of `pod`
///
/// The session lasts until the remote output closes. The end of the caller's
/// input only closes the command's stdin.
pub(super) async fn exec_in_pod(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    cmd: &[String],
    streams: ExecStreams,
) -> Result<()> {
    let params = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(true)
        .stderr(true)
        .tty(false);
    let mut attached = pods.exec(pod, cmd.to_vec(), &params).await?;

    let remote_stdin = attached
        .stdin()
        .ok_or_else(|| Error::ExecError("stdin was not attached".to_string()))?;
    let mut remote_stdout = attached
        .stdout()
        .ok_or_else(|| Error::ExecError("stdout was not attached".to_string()))?;
    let mut remote_stderr = attached
        .stderr()
        .ok_or_else(|| Error::ExecError("stderr was not attached".to_string()))?;

    let ExecStreams {
        stdin,
        mut stdout,
        mut stderr,
    } = streams;

    let output = async {
        tokio::try_join!(
            tokio::io::copy(&mut remote_stdout, &mut stdout),
            tokio::io::copy(&mut remote_stderr, &mut stderr),
        )
        .map_err(|e| Error::ExecError(format!("output: {e}")))?;
        stdout.flush().await?;
        stderr.flush().await?;
        Ok::<(), Error>(())
    };

    let result = run_exec_session(stdin, remote_stdin, output).await;
    debug!(pod, "Exec session finished");
    attached.abort();
    result
}

pub(super) async fn tail_logs(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    tail: usize,
) -> Result<String> {
    let params = LogParams {
        container: Some(container.to_string()),
        tail_lines: Some(tail as i64),
        ..Default::default()
    };
    Ok(pods.logs(pod, &params).await?)
}
