// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixed pool of workers draining a bounded work queue, producing a
//! fully populated [`RunnerResult`] and aggregating execution-level errors
//! (never test failures) across the run.

use crate::env::{EnvContext, EnvProvider, OrchestratorKind};
use crate::errors::{ExecuteError, SchedulerError};
use crate::executor::{ExecutionContext, Executor};
use crate::hierarchy::HierarchyManager;
use crate::sinks::{ProgressSink, RawJsonSink};
use camino::Utf8PathBuf;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Notify};
use validator_metadata::{RunId, RunnerResult, TestWork};

/// The hard ceiling on worker count regardless of what is requested or how
/// many work items there are.
const MAX_REASONABLE_CONCURRENCY: usize = 32;

/// Everything needed to construct a [`ParallelScheduler`]. The shape an
/// external configuration loader (out of scope for this crate) must fill
/// before handing a run to the [`crate::coordinator::Coordinator`].
#[derive(Clone)]
pub struct SchedulerConfig {
    /// 0 means auto (CPU count, still capped); negative is rejected.
    pub requested_concurrency: i64,
    pub run_id: RunId,
    pub orchestrator_kind: OrchestratorKind,
    pub allow_skips: bool,
    pub log_level: String,
    /// The test tool binary to invoke, e.g. `"go"`. Not hardcoded so a
    /// caller can point at a wrapper or a non-default toolchain.
    pub test_tool: Utf8PathBuf,
}

impl SchedulerConfig {
    pub fn env_provider(&self) -> EnvProvider {
        let orchestrator_kind = self.orchestrator_kind;
        let allow_skips = self.allow_skips;
        let run_id = self.run_id;
        let log_level = self.log_level.clone();
        Arc::new(move || EnvContext {
            orchestrator_kind,
            allow_skips,
            run_id,
            log_level: log_level.clone(),
            devnet_environment: None,
            control_scheme_override: None,
        })
    }
}

/// A token shared between the scheduler (and the executor it drives) and
/// its caller, to request early shutdown. Honored at every send/receive
/// point in the worker loop, and raced against a running child's deadline
/// in the executor so cancellation kills in-flight subprocesses promptly
/// rather than only stopping new dispatch.
#[derive(Clone)]
pub struct CancellationToken(Arc<CancellationInner>);

struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self(Arc::new(CancellationInner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called; resolves immediately if it
    /// already has been. Meant to be raced in a `select!` alongside a
    /// deadline or a child process's exit.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Drives a worker pool over a [`TestWork`] queue, calling an [`Executor`]
/// for each item and feeding results to the [`HierarchyManager`] on a
/// single consumer task.
pub struct ParallelScheduler {
    concurrency: usize,
    executor: Arc<dyn Executor>,
    env_provider: EnvProvider,
    raw_json_sink: Option<Arc<dyn RawJsonSink>>,
    progress: Arc<dyn ProgressSink>,
}

struct WorkerOutcome {
    work: TestWork,
    result: validator_metadata::TestResult,
    error: Option<ExecuteError>,
}

impl ParallelScheduler {
    /// Resolves `config.requested_concurrency` against `work_len` per the
    /// concurrency-determination rule, rejecting negative requests at
    /// construction time.
    pub fn new(
        config: &SchedulerConfig,
        work_len: usize,
        executor: Arc<dyn Executor>,
        raw_json_sink: Option<Arc<dyn RawJsonSink>>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, SchedulerError> {
        let concurrency = resolve_concurrency(config.requested_concurrency, work_len)?;
        Ok(Self {
            concurrency,
            executor,
            env_provider: config.env_provider(),
            raw_json_sink,
            progress,
        })
    }

    /// Runs every item in `work`, returning a fully finalized
    /// [`RunnerResult`] and, if one or more items failed to execute at
    /// all (as opposed to failing as a test), a [`SchedulerError`]
    /// describing the aggregate.
    pub async fn run(
        &self,
        run_id: RunId,
        work: Vec<TestWork>,
        cancel: CancellationToken,
    ) -> (RunnerResult, Option<SchedulerError>) {
        let mut run = HierarchyManager::new_run(run_id, true);

        if work.is_empty() {
            HierarchyManager::finalize(&mut run, Utc::now());
            return (run, None);
        }

        let total = work.len();
        let channel_capacity = (self.concurrency * 2).min(100).max(1);

        let (work_tx, work_rx) = mpsc::channel::<TestWork>(channel_capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<WorkerOutcome>(channel_capacity);

        let producer_cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            for item in work {
                if producer_cancel.is_cancelled() {
                    break;
                }
                if work_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let mut worker_handles = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let executor = Arc::clone(&self.executor);
            let env_provider = Arc::clone(&self.env_provider);
            let raw_json_sink = self.raw_json_sink.clone();
            let progress = Arc::clone(&self.progress);
            let worker_cancel = cancel.clone();

            let ctx_cancel = worker_cancel.clone();
            worker_handles.push(tokio::spawn(async move {
                let ctx = ExecutionContext {
                    env_provider,
                    raw_json_sink,
                    cancel: ctx_cancel,
                };
                loop {
                    if worker_cancel.is_cancelled() {
                        break;
                    }
                    let item = {
                        let mut rx = work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else { break };
                    progress.start_test(&item.result_key);
                    let (result, error) = run_one(Arc::clone(&executor), ctx.clone(), item.validator.clone()).await;
                    progress.update_test(&item.result_key, result.status);

                    let outcome = WorkerOutcome {
                        work: item,
                        result,
                        error,
                    };
                    if result_tx.send(outcome).await.is_err() || worker_cancel.is_cancelled() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut failures = Vec::new();
        while let Some(outcome) = result_rx.recv().await {
            if let Some(err) = outcome.error {
                failures.push((outcome.work.validator.id.clone(), err));
            }
            HierarchyManager::add_test_result(&mut run, &outcome.work, outcome.result);
        }

        let _ = producer.await;
        for handle in worker_handles {
            let _ = handle.await;
        }

        HierarchyManager::finalize(&mut run, Utc::now());

        let error = (!failures.is_empty()).then(|| SchedulerError::aggregate(total, failures));
        (run, error)
    }
}

/// Runs one `Executor::execute` call on its own task so a panic in the
/// executor (a bug in the executor itself, not the child process it
/// spawns) is recovered at this seam rather than taking down the whole
/// worker loop -- the target-language equivalent of returning an error
/// instead of unwinding. A recovered panic becomes a failing `TestResult`
/// with no `ExecuteError`, since it is a test failure, not an execution
/// failure: the scheduler error aggregate never mentions it.
async fn run_one(
    executor: Arc<dyn Executor>,
    ctx: ExecutionContext,
    validator: validator_metadata::ValidatorMetadata,
) -> (validator_metadata::TestResult, Option<ExecuteError>) {
    let metadata_for_panic = validator.clone();
    match tokio::spawn(async move { executor.execute(&ctx, &validator).await }).await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "test executor panicked".to_string()
            } else {
                format!("test executor task was cancelled: {join_err}")
            };
            (
                validator_metadata::TestResult::synthetic_failure(metadata_for_panic, message),
                None,
            )
        }
    }
}

/// `min(requested, workItemCount, MaxReasonableConcurrency)`. `0` is auto
/// (CPU count, still capped); negative is rejected.
fn resolve_concurrency(requested: i64, work_len: usize) -> Result<usize, SchedulerError> {
    if requested < 0 {
        return Err(SchedulerError::InvalidConcurrency(requested));
    }
    let base = if requested == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        if requested as usize > MAX_REASONABLE_CONCURRENCY {
            tracing::warn!(
                requested,
                cap = MAX_REASONABLE_CONCURRENCY,
                "requested concurrency exceeds the hard cap; capping"
            );
        }
        requested as usize
    };
    Ok(base.min(work_len.max(1)).min(MAX_REASONABLE_CONCURRENCY))
}

/// Measures the wall-clock span of a parallel run, for overwriting
/// `RunnerResult::wall_clock_time` after the fact (the Hierarchy Manager
/// only knows how to set it equal to the sequential-sum `duration`, which
/// is correct for the serial path but not for this one).
pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_concurrency_is_rejected() {
        let err = resolve_concurrency(-1, 10).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConcurrency(-1)));
    }

    #[test]
    fn zero_means_auto_and_is_capped_by_work_len() {
        let n = resolve_concurrency(0, 2).unwrap();
        assert!(n <= 2);
        assert!(n >= 1);
    }

    #[test]
    fn requested_concurrency_is_capped_at_hard_max() {
        let n = resolve_concurrency(1000, 1000).unwrap();
        assert_eq!(n, MAX_REASONABLE_CONCURRENCY);
    }

    #[test]
    fn requested_concurrency_is_capped_by_work_item_count() {
        let n = resolve_concurrency(32, 5).unwrap();
        assert_eq!(n, 5);
    }

    #[tokio::test]
    async fn empty_work_returns_immediately_with_no_error() {
        use crate::sinks::NoopSinks;
        use async_trait::async_trait;

        struct NeverCalled;
        #[async_trait]
        impl Executor for NeverCalled {
            async fn execute(
                &self,
                _ctx: &ExecutionContext,
                _validator: &validator_metadata::ValidatorMetadata,
            ) -> (validator_metadata::TestResult, Option<ExecuteError>) {
                panic!("must not be called for empty work");
            }
        }

        let config = SchedulerConfig {
            requested_concurrency: 0,
            run_id: RunId::new(),
            orchestrator_kind: OrchestratorKind::SysGo,
            allow_skips: false,
            log_level: "info".to_string(),
            test_tool: Utf8PathBuf::from("go"),
        };
        let scheduler = ParallelScheduler::new(
            &config,
            0,
            Arc::new(NeverCalled),
            None,
            Arc::new(NoopSinks),
        )
        .unwrap();

        let (run, error) = scheduler.run(config.run_id, Vec::new(), CancellationToken::new()).await;
        assert!(error.is_none());
        assert!(run.gates.is_empty());
    }
}
