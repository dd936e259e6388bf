//! Execute a built [`Invocation`] as a child process.

use crate::error::{Result, SignError};
use crate::invocation::Invocation;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Terminal result of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// Process exit code, `-1` when terminated by a signal.
    pub exit_code: i32,
    /// `exit_code == 0` and `output_path` exists on disk.
    pub succeeded: bool,
    pub output_path: PathBuf,
    pub stdout_text: String,
    pub stderr_text: String,
}

impl InvocationResult {
    /// Build a result, checking the expected output on disk.
    ///
    /// A zero exit code alone is not trusted.
    pub fn from_exit(
        exit_code: i32,
        output_path: PathBuf,
        stdout_text: String,
        stderr_text: String,
    ) -> Self {
        let succeeded = exit_code == 0 && output_path.is_file();
        Self {
            exit_code,
            succeeded,
            output_path,
            stdout_text,
            stderr_text,
        }
    }

    /// Last few lines of stderr (or stdout if stderr is empty) for user messages.
    #[must_use]
    pub fn error_excerpt(&self, max_lines: usize) -> String {
        let source = if self.stderr_text.trim().is_empty() {
            &self.stdout_text
        } else {
            &self.stderr_text
        };
        let lines: Vec<&str> = source
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Runs signing commands. The orchestrator is generic over this so tests can
/// substitute a stub.
pub trait Runner: Send + Sync {
    fn run(
        &self,
        invocation: &Invocation,
        expected_output: &Path,
    ) -> impl Future<Output = Result<InvocationResult>> + Send;
}

/// Real subprocess runner.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

/// Raw outcome of a child process.
#[derive(Debug, Clone)]
pub struct Captured {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessRunner {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Spawn, wait (bounded by the optional timeout) and collect output.
    ///
    /// Stdin is closed. The timeout covers the child and the draining of its
    /// output pipes. On timeout the child is killed and reaped before
    /// returning [`SignError::Timeout`].
    pub async fn capture(&self, invocation: &Invocation) -> Result<Captured> {
        let program = invocation.program().to_string_lossy().into_owned();

        let mut child = Command::new(invocation.program())
            .args(invocation.exec_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SignError::Launch { program, source })?;

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));
        let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];
        let deadline = self.timeout.map(|limit| (limit, Instant::now() + limit));

        let status = match deadline {
            Some((limit, at)) => match tokio::time::timeout_at(at, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    // kill() also waits for the child to exit
                    let _ = child.kill().await;
                    readers.iter().for_each(AbortHandle::abort);
                    return Err(SignError::Timeout { limit });
                }
            },
            None => child.wait().await?,
        };

        // Grandchildren may keep the pipes open after the child exits
        let streams = async {
            (
                stdout_task.await.unwrap_or_default(),
                stderr_task.await.unwrap_or_default(),
            )
        };
        let (stdout, stderr) = match deadline {
            Some((limit, at)) => match tokio::time::timeout_at(at, streams).await {
                Ok(streams) => streams,
                Err(_) => {
                    readers.iter().for_each(AbortHandle::abort);
                    return Err(SignError::Timeout { limit });
                }
            },
            None => streams.await,
        };

        Ok(Captured {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

impl Runner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, expected_output: &Path) -> Result<InvocationResult> {
        let captured = self.capture(invocation).await?;
        Ok(InvocationResult::from_exit(
            captured.exit_code,
            expected_output.to_path_buf(),
            captured.stdout,
            captured.stderr,
        ))
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_exit_without_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = InvocationResult::from_exit(
            0,
            dir.path().join("missing_signed.pdf"),
            String::new(),
            String::new(),
        );
        assert!(!result.succeeded);
    }

    #[test]
    fn test_zero_exit_with_output_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report_signed.pdf");
        std::fs::write(&out, b"%PDF-1.7").unwrap();
        assert!(InvocationResult::from_exit(0, out.clone(), String::new(), String::new()).succeeded);
        assert!(!InvocationResult::from_exit(1, out, String::new(), String::new()).succeeded);
    }

    #[test]
    fn test_error_excerpt_prefers_stderr_tail() {
        let result = InvocationResult::from_exit(
            2,
            PathBuf::from("x.pdf"),
            "stdout line".into(),
            "one\n\ntwo\nthree\n".into(),
        );
        assert_eq!(result.error_excerpt(2), "two\nthree");

        let result = InvocationResult::from_exit(2, PathBuf::from("x.pdf"), "only out".into(), " ".into());
        assert_eq!(result.error_excerpt(5), "only out");
    }
}
