// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chooses the serial or parallel execution path, drives the Parser,
//! Executor, Hierarchy Manager and Scheduler, and fans progress events out
//! to a [`ProgressSink`].

use crate::env::EnvProvider;
use crate::errors::SchedulerError;
use crate::executor::{ExecutionContext, Executor};
use crate::hierarchy::HierarchyManager;
use crate::scheduler::{CancellationToken, ParallelScheduler, SchedulerConfig, WallClock};
use crate::sinks::{NoopSinks, ProgressSink, RawJsonSink};
use indexmap::IndexMap;
use std::sync::Arc;
use validator_metadata::{RunId, RunnerResult, TestWork, ValidatorMetadata};

/// The default gate id a validator is filed under when its catalog entry
/// did not specify one.
const DEFAULT_GATE: &str = "default";

/// Chooses between the serial and parallel execution paths and drives the
/// whole run to completion.
pub struct Coordinator {
    executor: Arc<dyn Executor>,
    env_provider: EnvProvider,
    raw_json_sink: Option<Arc<dyn RawJsonSink>>,
    progress: Arc<dyn ProgressSink>,
}

impl Coordinator {
    pub fn new(executor: Arc<dyn Executor>, env_provider: EnvProvider) -> Self {
        Self {
            executor,
            env_provider,
            raw_json_sink: None,
            progress: Arc::new(NoopSinks),
        }
    }

    pub fn with_raw_json_sink(mut self, sink: Arc<dyn RawJsonSink>) -> Self {
        self.raw_json_sink = Some(sink);
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every validator in `validators`, either serially (`parallel =
    /// false`) or over the scheduler's worker pool (`parallel = true`).
    /// `cancel` is the caller's handle on the run: holding it lets a caller
    /// trigger early shutdown (e.g. on a signal) from outside this crate,
    /// which is otherwise unreachable once the run has started.
    pub async fn run(
        &self,
        run_id: RunId,
        validators: Vec<ValidatorMetadata>,
        parallel: bool,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> (RunnerResult, Option<SchedulerError>) {
        let work = flatten(validators);
        self.announce_progress(&work);

        if parallel {
            self.run_parallel(run_id, work, config, cancel).await
        } else {
            (self.run_serial(run_id, work, cancel).await, None)
        }
    }

    async fn run_serial(&self, run_id: RunId, work: Vec<TestWork>, cancel: CancellationToken) -> RunnerResult {
        let mut run = HierarchyManager::new_run(run_id, false);
        let ctx = ExecutionContext {
            env_provider: Arc::clone(&self.env_provider),
            raw_json_sink: self.raw_json_sink.clone(),
            cancel: cancel.clone(),
        };

        for item in work {
            if cancel.is_cancelled() {
                break;
            }
            self.progress.start_test(&item.result_key);
            let (result, _error) = self.executor.execute(&ctx, &item.validator).await;
            self.progress.update_test(&item.result_key, result.status);
            HierarchyManager::add_test_result(&mut run, &item, result);
        }

        HierarchyManager::finalize(&mut run, chrono::Utc::now());
        self.announce_completion(&run);
        run
    }

    async fn run_parallel(
        &self,
        run_id: RunId,
        work: Vec<TestWork>,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> (RunnerResult, Option<SchedulerError>) {
        let scheduler = match ParallelScheduler::new(
            config,
            work.len(),
            Arc::clone(&self.executor),
            self.raw_json_sink.clone(),
            Arc::clone(&self.progress),
        ) {
            Ok(scheduler) => scheduler,
            Err(err) => return (HierarchyManager::new_run(run_id, true), Some(err)),
        };

        let clock = WallClock::start();
        let (mut run, error) = scheduler.run(run_id, work, cancel).await;
        run.wall_clock_time = clock.elapsed();
        self.announce_completion(&run);
        (run, error)
    }

    /// Notifies the progress sink that every suite and gate in `run` has
    /// finished, once per container, after the hierarchy has been
    /// finalized.
    fn announce_completion(&self, run: &RunnerResult) {
        for (gate_id, gate) in &run.gates {
            for suite_id in gate.suites.keys() {
                self.progress.complete_suite(suite_id);
            }
            self.progress.complete_gate(gate_id);
        }
    }

    /// Walks the flat work list once, grouping per-gate and per-suite
    /// totals, and notifies the progress sink before any work starts.
    fn announce_progress(&self, work: &[TestWork]) {
        let mut gate_totals: IndexMap<String, usize> = IndexMap::new();
        let mut suite_totals: IndexMap<String, usize> = IndexMap::new();

        for item in work {
            *gate_totals.entry(item.gate_id.clone()).or_insert(0) += 1;
            if let Some(suite_id) = &item.suite_id {
                *suite_totals.entry(suite_id.clone()).or_insert(0) += 1;
            }
        }

        for (gate_id, total) in &gate_totals {
            self.progress.start_gate(gate_id, *total);
        }
        for (suite_id, total) in &suite_totals {
            self.progress.start_suite(suite_id, *total);
        }
    }
}

/// Flattens validators into `TestWork`, grouping gate membership (defaulting
/// absent gates to `"default"`) and suite membership as supplied by each
/// validator's own metadata.
fn flatten(validators: Vec<ValidatorMetadata>) -> Vec<TestWork> {
    validators
        .into_iter()
        .map(|validator| {
            let gate_id = if validator.gate.is_empty() {
                DEFAULT_GATE.to_string()
            } else {
                validator.gate.clone()
            };
            let suite = validator.suite.clone();
            let work = TestWork::new(validator, gate_id);
            match suite {
                Some(suite_id) => work.with_suite(suite_id),
                None => work,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvContext, OrchestratorKind};
    use crate::executor::Executor;
    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use std::time::Duration;
    use validator_metadata::{TestResult, TestStatus, ValidatorType};

    fn metadata(id: &str, gate: &str) -> ValidatorMetadata {
        ValidatorMetadata {
            id: id.to_string(),
            gate: gate.to_string(),
            suite: None,
            package: Utf8PathBuf::from("./pkg"),
            func_name: Some(id.to_string()),
            run_all: false,
            timeout: Duration::ZERO,
            validator_type: ValidatorType::Acceptance,
        }
    }

    struct StubExecutor;

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            validator: &ValidatorMetadata,
        ) -> (TestResult, Option<crate::errors::ExecuteError>) {
            let status = if validator.id.contains("fail") {
                TestStatus::Fail
            } else {
                TestStatus::Pass
            };
            (
                TestResult {
                    metadata: validator.clone(),
                    status,
                    duration: Duration::from_millis(5),
                    error: None,
                    stdout: None,
                    timed_out: false,
                    sub_tests: IndexMap::new(),
                },
                None,
            )
        }
    }

    fn noop_env_provider() -> EnvProvider {
        Arc::new(|| EnvContext {
            orchestrator_kind: OrchestratorKind::SysGo,
            allow_skips: false,
            run_id: RunId::new(),
            log_level: "info".to_string(),
            devnet_environment: None,
            control_scheme_override: None,
        })
    }

    #[test]
    fn missing_gate_defaults_to_default() {
        let mut validator = metadata("v1", "");
        validator.gate = String::new();
        let work = flatten(vec![validator]);
        assert_eq!(work[0].gate_id, DEFAULT_GATE);
    }

    #[tokio::test]
    async fn serial_run_visits_every_validator() {
        let coordinator = Coordinator::new(Arc::new(StubExecutor), noop_env_provider());
        let config = SchedulerConfig {
            requested_concurrency: 0,
            run_id: RunId::new(),
            orchestrator_kind: OrchestratorKind::SysGo,
            allow_skips: false,
            log_level: "info".to_string(),
            test_tool: Utf8PathBuf::from("go"),
        };

        let validators = vec![metadata("v1", "gate-a"), metadata("v2-fail", "gate-a")];
        let (run, error) = coordinator
            .run(config.run_id, validators, false, &config, CancellationToken::new())
            .await;
        assert!(error.is_none());
        assert_eq!(run.status, TestStatus::Fail);
        assert_eq!(run.gates["gate-a"].tests.len(), 2);
    }

    #[tokio::test]
    async fn parallel_run_aggregates_across_workers() {
        let coordinator = Coordinator::new(Arc::new(StubExecutor), noop_env_provider());
        let config = SchedulerConfig {
            requested_concurrency: 0,
            run_id: RunId::new(),
            orchestrator_kind: OrchestratorKind::SysGo,
            allow_skips: false,
            log_level: "info".to_string(),
            test_tool: Utf8PathBuf::from("go"),
        };

        let validators = vec![metadata("v1", "gate-a"), metadata("v2", "gate-b")];
        let (run, error) = coordinator
            .run(config.run_id, validators, true, &config, CancellationToken::new())
            .await;
        assert!(error.is_none());
        assert_eq!(run.status, TestStatus::Pass);
        assert_eq!(run.gates.len(), 2);
    }
}
