//! Generated test execution.
//!
//! The test file is written into the session's mounted code tree (so the
//! container sees it too) and run on the host with the configured runner,
//! pointed at the sandbox through `BASE_URL`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::report::{truncate_log, VerificationResult};
use crate::sandbox::SandboxSession;

/// Directory inside the code tree that holds generated files.
pub const GENERATED_DIR: &str = ".code-analyzer";

/// How long to wait for output pipes after the runner exits.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs generated tests against a ready sandbox.
#[derive(Debug, Clone)]
pub struct TestExecutor {
    config: ExecutorConfig,
}

impl TestExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs `test_code` against `base_url`, giving up after `timeout`.
    ///
    /// A timeout is a failed verdict, not an error. Errors are reserved for
    /// runs that could not be started at all.
    pub async fn execute(
        &self,
        session: &SandboxSession,
        test_code: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<VerificationResult> {
        let test_file = self.materialize(session.code_root(), test_code).await?;
        let outcome = self.run(&test_file, session.code_root(), base_url, timeout).await;

        if let Err(e) = tokio::fs::remove_file(&test_file).await {
            tracing::warn!(path = ?test_file, error = %e, "failed to remove generated test file");
        }

        let (tests_passed, log) = outcome?;
        tracing::info!(
            session_id = %session.id(),
            tests_passed,
            log_bytes = log.len(),
            "test run finished"
        );
        Ok(VerificationResult::new(test_code, tests_passed, log))
    }

    async fn materialize(&self, code_root: &Path, test_code: &str) -> Result<PathBuf> {
        let dir = code_root.join(GENERATED_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::TestExecution(format!("failed to create {}: {}", dir.display(), e)))?;

        let path = dir.join(format!("generated.test.{}", self.config.file_extension));
        tokio::fs::write(&path, test_code)
            .await
            .map_err(|e| Error::TestExecution(format!("failed to write test file: {}", e)))?;
        Ok(path)
    }

    async fn run(
        &self,
        test_file: &Path,
        work_dir: &Path,
        base_url: &str,
        timeout: Duration,
    ) -> Result<(bool, String)> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| Error::TestExecution("test runner command is empty".to_string()))?;

        tracing::debug!(runner = %program, file = ?test_file, base_url, "running generated tests");

        let mut child = Command::new(program)
            .args(args)
            .arg(test_file)
            .current_dir(work_dir)
            .env("BASE_URL", base_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TestExecution(format!("failed to spawn {}: {}", program, e)))?;

        let limit = self.config.max_log_bytes;
        let stdout = child.stdout.take().map(|out| tokio::spawn(read_bounded(out, limit)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_bounded(err, limit)));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                return Err(Error::TestExecution(format!("failed to wait for {}: {}", program, e)))
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "test run timed out");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill test runner");
                }
                None
            }
        };

        let mut log = drain(stdout).await;
        let stderr = drain(stderr).await;
        if !stderr.trim().is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&stderr);
        }
        let log = log.trim();
        let tests_passed = match status {
            Some(status) => verdict_marker(log).unwrap_or(status.success()),
            None => false,
        };

        // The timeout marker goes on after truncation.
        let mut log = truncate_log(log.to_string(), self.config.max_log_bytes);
        if status.is_none() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&format!(
                "[test execution timed out after {}s]",
                timeout.as_secs()
            ));
        }

        if log.is_empty() {
            log = "(no output)".to_string();
        }

        Ok((tests_passed, log))
    }
}

/// Keeps at most `limit + 1` bytes of `reader` and discards the rest.
///
/// The extra byte lets the caller see that truncation happened. The pipe is
/// still read to the end so the runner never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let keep = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    if let Err(e) = (&mut reader).take(keep).read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "output pipe closed with error");
        return buf;
    }
    match tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        Ok(0) => {}
        Ok(dropped) => tracing::debug!(dropped, "discarded test runner output past the log limit"),
        Err(e) => tracing::debug!(error = %e, "output pipe closed with error"),
    }
    buf
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "output reader failed");
            String::new()
        }
        Err(_) => {
            // A detached grandchild is still holding the pipe open.
            task.abort();
            String::new()
        }
    }
}

/// Finds the last `VERDICT: PASS` / `VERDICT: FAIL` line in `log`.
pub fn verdict_marker(log: &str) -> Option<bool> {
    log.lines().rev().find_map(|line| match line.trim() {
        "VERDICT: PASS" => Some(true),
        "VERDICT: FAIL" => Some(false),
        _ => None,
    })
}
