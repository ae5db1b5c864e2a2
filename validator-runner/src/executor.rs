// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spawns one test subprocess per validator, supervises its timeout, and
//! hands captured output to the parser.

use crate::env::{self, EnvProvider};
use crate::errors::ExecuteError;
use crate::parser;
use crate::scheduler::CancellationToken;
use crate::sinks::RawJsonSink;
use async_trait::async_trait;
use bstr::ByteSlice;
use bytes::{Bytes, BytesMut};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};
use validator_metadata::{fold_statuses, TestResult, ValidatorMetadata};

/// Discovery of test names in a package (`-list ^Test`) has a hard timeout
/// independent of any per-test timeout, so a hung discovery call can't wedge
/// a whole run.
const LIST_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Small grace added on top of a validator's own timeout so the child
/// self-reports a timeout (and the parser can observe a genuine partial
/// stream) before the supervisor kills it.
const TIMEOUT_GRACE: Duration = Duration::from_millis(200);

/// Each captured stream (stdout, stderr) is bounded to this many trailing
/// bytes; anything earlier is dropped as the child keeps producing output.
const DEFAULT_TAIL_BYTES: usize = 5 * 1024 * 1024;

/// Everything the executor needs beyond the validator itself: how to build
/// a child's environment, and where to archive its raw event stream.
#[derive(Clone)]
pub struct ExecutionContext {
    pub env_provider: EnvProvider,
    pub raw_json_sink: Option<Arc<dyn RawJsonSink>>,
    /// Checked (and raced against a running child) so a cancelled run kills
    /// in-flight subprocesses promptly instead of only stopping new
    /// dispatch at the worker-loop level.
    pub cancel: CancellationToken,
}

/// Produces a [`TestResult`] for a single [`ValidatorMetadata`].
///
/// A trait, rather than a concrete type, so the scheduler can be exercised
/// against an in-process fake that never spawns a real subprocess (see
/// `tests/scenarios.rs`).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        validator: &ValidatorMetadata,
    ) -> (TestResult, Option<ExecuteError>);
}

/// How a supervised child's wait raced against its deadline and a
/// run-level cancellation.
enum WaitOutcome {
    Finished(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// The real executor: spawns the configured test tool (`go` by default) as
/// a subprocess per the stable command line in §6.
pub struct SubprocessExecutor {
    test_tool: Utf8PathBuf,
    tail_bytes: usize,
}

impl SubprocessExecutor {
    pub fn new(test_tool: impl Into<Utf8PathBuf>) -> Self {
        Self {
            test_tool: test_tool.into(),
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

    pub fn with_tail_bytes(mut self, tail_bytes: usize) -> Self {
        self.tail_bytes = tail_bytes;
        self
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_tests(&self, package: &Utf8PathBuf) -> Result<Vec<String>, ExecuteError> {
        debug!(%package, "discovering test names");
        let mut cmd = Command::new(self.test_tool.as_str());
        cmd.arg("test")
            .arg(package.as_str())
            .arg("-list")
            .arg("^Test")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|source| ExecuteError::ListFailed { package: package.clone(), source })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stdout_task = tokio::spawn(read_bounded(stdout, self.tail_bytes));

        match tokio::time::timeout(LIST_DISCOVERY_TIMEOUT, child.wait()).await {
            Ok(Ok(_status)) => {
                let (bytes, _overflowed) = stdout_task.await.unwrap_or_default();
                let text = bytes.to_str_lossy();
                Ok(text
                    .lines()
                    .map(str::trim)
                    .filter(|line| line.starts_with("Test"))
                    .map(str::to_string)
                    .collect())
            }
            Ok(Err(source)) => Err(ExecuteError::ListFailed { package: package.clone(), source }),
            Err(_elapsed) => {
                let _ = child.start_kill();
                Err(ExecuteError::ListTimeout {
                    package: package.clone(),
                    timeout: LIST_DISCOVERY_TIMEOUT,
                })
            }
        }
    }

    #[instrument(level = "debug", skip(self, ctx), fields(test_id = %metadata.id, gate_id = %metadata.gate))]
    async fn execute_single(
        &self,
        metadata: &ValidatorMetadata,
        ctx: &ExecutionContext,
    ) -> (TestResult, Option<ExecuteError>) {
        debug!("running test");

        if ctx.cancel.is_cancelled() {
            return (
                TestResult::synthetic_failure(metadata.clone(), "run cancelled".to_string()),
                None,
            );
        }

        let mut cmd = Command::new(self.test_tool.as_str());
        cmd.arg("test");

        let package_arg = if metadata.package.as_str().is_empty() {
            "./...".to_string()
        } else {
            metadata.package.to_string()
        };
        cmd.arg(package_arg);

        if !metadata.targets_whole_package() {
            if let Some(name) = &metadata.func_name {
                cmd.arg("-run").arg(format!("^{name}$"));
            }
        }
        cmd.arg("-count").arg("1");
        if metadata.has_timeout() {
            cmd.arg("-timeout").arg(format!("{:?}", metadata.timeout));
        }
        cmd.arg("-v").arg("-json");
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let env_ctx = (ctx.env_provider)();
        let child_env = match env::build_child_env(&env_ctx) {
            Ok(env) => env,
            Err(source) => {
                return (
                    TestResult::synthetic_failure(
                        metadata.clone(),
                        format!("failed to prepare environment: {source}"),
                    ),
                    Some(ExecuteError::EnvFileWrite(source)),
                );
            }
        };
        for (key, value) in &child_env.vars {
            cmd.env(key, value);
        }

        let mut child: Child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                return (
                    TestResult::synthetic_failure(metadata.clone(), format!("failed to spawn test subprocess: {source}")),
                    Some(ExecuteError::Spawn { id: metadata.id.clone(), source }),
                );
            }
        };
        // Keep the devnet env file alive for exactly as long as the child
        // needs it; it is removed on drop at the end of this function,
        // on every return path including the timeout branch below.
        let _devnet_file_guard = child_env.devnet_file_guard;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(read_bounded(stdout, self.tail_bytes));
        let stderr_task = tokio::spawn(read_bounded(stderr, self.tail_bytes));

        let deadline = metadata.has_timeout().then(|| metadata.timeout + TIMEOUT_GRACE);

        let outcome = match deadline {
            Some(deadline) => {
                tokio::select! {
                    status = child.wait() => WaitOutcome::Finished(status),
                    _ = tokio::time::sleep(deadline) => WaitOutcome::TimedOut,
                    _ = ctx.cancel.cancelled() => WaitOutcome::Cancelled,
                }
            }
            None => {
                tokio::select! {
                    status = child.wait() => WaitOutcome::Finished(status),
                    _ = ctx.cancel.cancelled() => WaitOutcome::Cancelled,
                }
            }
        };

        let cancelled = match outcome {
            WaitOutcome::Finished(status) => {
                return self.finish_single(metadata, ctx, status, stdout_task, stderr_task).await
            }
            WaitOutcome::TimedOut => false,
            WaitOutcome::Cancelled => {
                debug!("test cancelled");
                true
            }
        };

        let _ = child.start_kill();
        let _ = child.wait().await;
        let (stdout_bytes, _) = stdout_task.await.unwrap_or_default();
        let _ = stderr_task.await;

        if let Some(sink) = &ctx.raw_json_sink {
            sink.store(&metadata.id, &stdout_bytes);
        }

        if cancelled {
            return (
                TestResult::synthetic_failure(metadata.clone(), "run cancelled".to_string()),
                None,
            );
        }

        let result = parser::parse_with_timeout(&stdout_bytes, metadata, metadata.timeout);
        (result, None)
    }

    async fn finish_single(
        &self,
        metadata: &ValidatorMetadata,
        ctx: &ExecutionContext,
        status: std::io::Result<std::process::ExitStatus>,
        stdout_task: tokio::task::JoinHandle<(Bytes, bool)>,
        stderr_task: tokio::task::JoinHandle<(Bytes, bool)>,
    ) -> (TestResult, Option<ExecuteError>) {
        let status = match status {
            Ok(status) => status,
            Err(source) => {
                return (
                    TestResult::synthetic_failure(metadata.clone(), format!("failed waiting for child: {source}")),
                    Some(ExecuteError::Spawn { id: metadata.id.clone(), source }),
                );
            }
        };

        let (stdout_bytes, _stdout_overflowed) = stdout_task.await.unwrap_or_default();
        let (stderr_bytes, _stderr_overflowed) = stderr_task.await.unwrap_or_default();

        if let Some(sink) = &ctx.raw_json_sink {
            sink.store(&metadata.id, &stdout_bytes);
        }

        let mut result = parser::parse(&stdout_bytes, metadata);
        if !status.success() && !stderr_bytes.is_empty() {
            let stderr_text = stderr_bytes.to_str_lossy();
            result.error = Some(match result.error.take() {
                Some(existing) => format!("{existing}\nstderr: {stderr_text}"),
                None => format!("stderr: {stderr_text}"),
            });
        }
        (result, None)
    }

    #[instrument(level = "debug", skip(self, ctx), fields(test_id = %validator.id, gate_id = %validator.gate))]
    async fn execute_run_all(
        &self,
        validator: &ValidatorMetadata,
        ctx: &ExecutionContext,
    ) -> (TestResult, Option<ExecuteError>) {
        debug!("running all discovered tests in package");
        let names = match self.list_tests(&validator.package).await {
            Ok(names) => names,
            Err(err) => {
                return (
                    TestResult::synthetic_failure(validator.clone(), err.to_string()),
                    Some(err),
                );
            }
        };

        let mut sub_tests = IndexMap::new();
        let mut total_duration = Duration::ZERO;
        let mut any_timed_out = false;
        let mut raw_concat = Vec::new();
        let mut first_error = None;

        for name in names {
            let mut child_metadata = validator.clone();
            child_metadata.func_name = Some(name.clone());
            child_metadata.run_all = false;
            child_metadata.id = format!("{}::{}", validator.id, name);

            let (result, err) = self.execute_single(&child_metadata, ctx).await;
            total_duration += result.duration;
            any_timed_out |= result.timed_out;

            if let Some(sink) = &ctx.raw_json_sink {
                if let Some(bytes) = sink.get(&child_metadata.id) {
                    raw_concat.extend_from_slice(&bytes);
                }
            }
            if first_error.is_none() {
                first_error = err;
            }
            sub_tests.insert(name, result);
        }

        if let Some(sink) = &ctx.raw_json_sink {
            sink.store(&validator.id, &raw_concat);
        }

        let status = fold_statuses(sub_tests.values().map(|t| t.status));
        let result = TestResult {
            metadata: validator.clone(),
            status,
            duration: total_duration,
            error: None,
            stdout: None,
            timed_out: any_timed_out,
            sub_tests,
        };
        (result, first_error)
    }
}

#[async_trait]
impl Executor for SubprocessExecutor {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        validator: &ValidatorMetadata,
    ) -> (TestResult, Option<ExecuteError>) {
        if !package_path_is_valid(&validator.package) {
            let err = ExecuteError::PackageNotFound(validator.package.clone());
            return (
                TestResult::synthetic_failure(validator.clone(), err.to_string()),
                Some(err),
            );
        }

        if validator.run_all {
            self.execute_run_all(validator, ctx).await
        } else {
            self.execute_single(validator, ctx).await
        }
    }
}

/// `"./..."` and the empty path are sentinels meaning "the whole module",
/// not a path on disk, so they skip the existence check.
fn package_path_is_valid(package: &Utf8PathBuf) -> bool {
    let raw = package.as_str();
    if raw.is_empty() || raw == "./..." {
        return true;
    }
    std::path::Path::new(raw).is_dir()
}

/// Reads `reader` to EOF, retaining only the last `cap` bytes. Returns the
/// retained bytes and whether anything was dropped.
async fn read_bounded<R>(mut reader: R, cap: usize) -> (Bytes, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    let mut overflowed = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > cap {
                    let excess = buf.len() - cap;
                    let _ = buf.split_to(excess);
                    overflowed = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf.freeze(), overflowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotdotdot_and_empty_package_skip_existence_check() {
        assert!(package_path_is_valid(&Utf8PathBuf::from("./...")));
        assert!(package_path_is_valid(&Utf8PathBuf::from("")));
    }

    #[test]
    fn missing_local_package_is_invalid() {
        assert!(!package_path_is_valid(&Utf8PathBuf::from(
            "/nonexistent/path/for/validator-runner/tests"
        )));
    }

    #[tokio::test]
    async fn read_bounded_keeps_only_the_tail() {
        let data = vec![b'a'; 100];
        let (out, overflowed) = read_bounded(std::io::Cursor::new(data), 10).await;
        assert!(overflowed);
        assert_eq!(out.len(), 10);
    }

    #[tokio::test]
    async fn read_bounded_under_cap_is_not_flagged() {
        let (out, overflowed) = read_bounded(std::io::Cursor::new(b"hello".to_vec()), 100).await;
        assert!(!overflowed);
        assert_eq!(&out[..], b"hello");
    }
}
