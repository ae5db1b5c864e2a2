// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Materializes gates/suites/tests/subtests and computes roll-up statuses
//! and statistics.
//!
//! All mutations here happen on the scheduler's single-consumer result
//! collection path (see [`crate::scheduler`]); the manager itself does not
//! lock anything. Callers must serialize calls against a given
//! [`RunnerResult`].

use chrono::{DateTime, Utc};
use validator_metadata::{GateResult, RunId, RunnerResult, SuiteResult, TestResult};

/// A unit of scheduled work paired with its destination in the hierarchy.
/// Re-exported here under the manager's vocabulary; see
/// [`validator_metadata::TestWork`] for the canonical definition.
pub use validator_metadata::TestWork;

/// Stateless façade over the result hierarchy operations. Every method
/// takes the tree being mutated explicitly rather than holding it, so that
/// ownership of a `RunnerResult` stays with whichever single consumer (the
/// scheduler's result loop, or the coordinator's serial loop) is driving a
/// given run.
pub struct HierarchyManager;

impl HierarchyManager {
    /// `NewRunResult`: a fresh, fail-closed run with no gates.
    pub fn new_run(run_id: RunId, is_parallel: bool) -> RunnerResult {
        RunnerResult::new(run_id, is_parallel)
    }

    /// `AddTestResult`: idempotently creates the gate (and suite, if
    /// `work.suite_id` is set) then inserts `result` under
    /// `work.result_key`, updating running stats at every level touched.
    pub fn add_test_result(run: &mut RunnerResult, work: &TestWork, result: TestResult) {
        let gate = run
            .gates
            .entry(work.gate_id.clone())
            .or_insert_with(|| GateResult::new(work.gate_id.clone()));

        if let Some(suite_id) = &work.suite_id {
            let suite = gate
                .suites
                .entry(suite_id.clone())
                .or_insert_with(|| SuiteResult::new(suite_id.clone()));
            suite.tests.insert(work.result_key.clone(), result.clone());
            accumulate(&mut suite.stats, &mut suite.duration, &result);
        } else {
            gate.tests.insert(work.result_key.clone(), result.clone());
        }

        accumulate(&mut gate.stats, &mut gate.duration, &result);
        accumulate(&mut run.stats, &mut run.duration, &result);
    }

    /// `FinalizeResults`: computes status per the roll-up invariant for
    /// each suite, then each gate, then the run, and stamps `EndTime`
    /// everywhere. For a serial run, `WallClockTime` equals `Duration` at
    /// every level (sequential execution has no overlap to account for);
    /// for a parallel run the scheduler overwrites the run-level
    /// `WallClockTime` with the measured wall-clock span afterwards.
    pub fn finalize(run: &mut RunnerResult, end_time: DateTime<Utc>) {
        for gate in run.gates.values_mut() {
            for suite in gate.suites.values_mut() {
                suite.finalize(end_time);
                suite.wall_clock_time = suite.duration;
            }
            gate.finalize(end_time);
            gate.wall_clock_time = gate.duration;
        }
        run.finalize(end_time);
        run.wall_clock_time = run.duration;
    }
}

/// Adds `result.duration` to the container's running total -- not
/// recursing into subtests, since a test's own `duration` already reflects
/// however long its subtests took as part of the same subprocess
/// invocation (see the duration rule in the parser). Stats, by contrast,
/// count every node in the tree, main test and subtests alike (invariant
/// 4: a package test with N subtests contributes 1 + N to `Total`).
fn accumulate(
    stats: &mut validator_metadata::ResultStats,
    duration: &mut std::time::Duration,
    result: &TestResult,
) {
    *duration += result.duration;
    record_tree(stats, result);
}

fn record_tree(stats: &mut validator_metadata::ResultStats, result: &TestResult) {
    stats.record_leaf(result.status);
    for sub in result.sub_tests.values() {
        record_tree(stats, sub);
    }
}
