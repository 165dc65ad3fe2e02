//! Runs worker processes under the task protocol.

use super::protocol::{ExternalTask, ExternalTaskRequest};
use super::signal;
use crate::cancellation::CancellationToken;
use crate::errors::{truncate_diagnostics, ExternalProcessError};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default time a worker gets to exit after SIGTERM.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for pipe readers once the worker is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Environment variable carrying the task name.
pub const TASK_ENV: &str = "STAGERUN_TASK";

/// Environment variable carrying the correlation id.
pub const CORRELATION_ENV: &str = "STAGERUN_CORRELATION_ID";

/// Invokes a worker executable once per task.
///
/// Each call spawns a fresh process, writes the request to its stdin,
/// and reads one response document from stdout. Stderr is captured for
/// diagnostics. On timeout or cancellation the worker gets SIGTERM, then
/// SIGKILL once the grace period runs out.
#[derive(Debug, Clone)]
pub struct ExternalProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    grace_period: Duration,
}

enum Waited {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ExternalProcessExecutor {
    /// Creates an executor for `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Appends a command-line argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several command-line arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the worker.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets the worker's working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the time allowed between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The worker program.
    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Runs `task` and returns its validated result object.
    pub async fn execute(
        &self,
        task: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ExternalProcessError> {
        self.execute_with_cancel(task, arguments, timeout, &CancellationToken::new())
            .await
    }

    /// Runs `task`, terminating the worker early if `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        task: &str,
        arguments: serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExternalProcessError> {
        let request = ExternalTaskRequest::new(task, None, arguments);
        self.invoke(&request, timeout, cancel).await
    }

    /// Runs a typed task and deserializes its result.
    pub async fn execute_task<T: ExternalTask>(
        &self,
        task: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T::Output, ExternalProcessError> {
        let arguments = serde_json::to_value(task).map_err(|e| ExternalProcessError::Io {
            task: T::NAME.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        let request = ExternalTaskRequest::new(T::NAME, Some(T::VERSION), arguments);
        let result = self.invoke(&request, timeout, cancel).await?;
        serde_json::from_value(result.clone()).map_err(|e| ExternalProcessError::MalformedOutput {
            task: T::NAME.to_string(),
            reason: format!("result does not match task contract: {e}"),
            stdout: truncate_diagnostics(result.to_string().as_bytes()),
        })
    }

    async fn invoke(
        &self,
        request: &ExternalTaskRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExternalProcessError> {
        let task = request.task.as_str();
        let io_error = |source: io::Error| ExternalProcessError::Io {
            task: task.to_string(),
            source,
        };

        if cancel.is_cancelled() {
            return Err(ExternalProcessError::Cancelled {
                task: task.to_string(),
            });
        }

        let payload = serde_json::to_vec(request)
            .map_err(|e| io_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let mut child = self.spawn(request)?;
        debug!(
            task,
            correlation_id = %request.correlation_id,
            pid = child.id(),
            "Spawned worker"
        );

        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                match stdin.write_all(&payload).await {
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
                    other => other?,
                }
                // Dropping stdin closes the pipe and signals end of request.
                drop(stdin);
                Ok::<(), io::Error>(())
            })
        });
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            () = tokio::time::sleep(timeout) => Waited::TimedOut,
            () = cancel.cancelled() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(status) => status.map_err(io_error)?,
            Waited::TimedOut => {
                warn!(
                    task,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Worker timed out"
                );
                self.terminate(&mut child, task).await;
                let stderr = drain(stderr).await;
                return Err(ExternalProcessError::Timeout {
                    task: task.to_string(),
                    after: timeout,
                    stderr: truncate_diagnostics(&stderr),
                });
            }
            Waited::Cancelled => {
                warn!(task, reason = %cancel.reason_or_default(), "Terminating worker on cancellation");
                self.terminate(&mut child, task).await;
                return Err(ExternalProcessError::Cancelled {
                    task: task.to_string(),
                });
            }
        };

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        if !status.success() {
            return Err(ExternalProcessError::NonZeroExit {
                task: task.to_string(),
                code: status.code(),
                stderr: truncate_diagnostics(&stderr),
            });
        }

        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| io_error(io::Error::other(e)))?
                .map_err(io_error)?;
        }

        let result = request.validate_response(&stdout)?;
        debug!(task, correlation_id = %request.correlation_id, "Worker completed");
        Ok(result)
    }

    fn spawn(&self, request: &ExternalTaskRequest) -> Result<Child, ExternalProcessError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(TASK_ENV, &request.task)
            .env(CORRELATION_ENV, &request.correlation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|source| {
            let program = self.program.display().to_string();
            if source.kind() == io::ErrorKind::NotFound {
                ExternalProcessError::NotFound { program }
            } else {
                ExternalProcessError::Spawn { program, source }
            }
        })
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, task: &str) {
        if let Some(pid) = child.id() {
            if signal::terminate(pid) {
                match tokio::time::timeout(self.grace_period, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(task, pid, ?status, "Worker exited after SIGTERM");
                        return;
                    }
                    Ok(Err(e)) => warn!(task, pid, error = %e, "Waiting for worker failed"),
                    Err(_) => warn!(
                        task,
                        pid,
                        grace_ms = u64::try_from(self.grace_period.as_millis()).unwrap_or(u64::MAX),
                        "Worker ignored SIGTERM, killing"
                    ),
                }
            }
        }
        if let Err(e) = child.kill().await {
            warn!(task, error = %e, "Failed to kill worker");
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<io::Result<Vec<u8>>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).await?;
            Ok(buf)
        })
    })
}

/// Collects a reader's bytes. A grandchild holding the pipe open must not
/// block us, so this gives up after [`DRAIN_TIMEOUT`].
async fn drain(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await {
        Ok(Ok(Ok(bytes))) => bytes,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Reading worker output failed");
            Vec::new()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Worker output reader panicked");
            Vec::new()
        }
        Err(_) => {
            reader.abort();
            Vec::new()
        }
    }
}
