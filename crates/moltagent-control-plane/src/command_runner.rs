//! Generic subprocess execution with timeout and guaranteed process kill.
//!
//! The production implementation uses tokio; test doubles can return
//! canned results without spawning processes. Used by the local-container
//! provider to drive the `docker` CLI.

use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

/// Default timeout for container CLI commands.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Command execution behind a trait so providers stay testable.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command with the default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run a command with a custom timeout (overrides default).
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;
}

/// Production `CommandRunner` backed by `tokio::process`.
///
/// `tokio::time::timeout` around `.output().await` does not kill the child
/// when the timeout fires on every platform — the future is dropped but the
/// OS process keeps running. This implementation uses `tokio::select!` with
/// explicit `child.kill()` to guarantee termination.
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CMD_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.run_with_timeout(program, args, self.timeout).await
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Read stdout/stderr CONCURRENTLY with wait() to avoid pipe deadlock:
        // a child writing past the OS pipe buffer blocks on write, so waiting
        // before draining would never resolve.
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                Ok(Output {
                    status: status.with_context(|| format!("waiting for {program}"))?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
            }
        }
    }
}
