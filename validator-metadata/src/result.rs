// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The three-level result hierarchy: gate -> suite -> test -> subtest.
//!
//! Containers are owned trees (design note: "model as owned trees. Each
//! container exclusively owns its children"). `IndexMap` is used everywhere
//! instead of `HashMap` so that the serial coordinator's "iterate gates in
//! map order" behavior (see the coordinator in `validator-runner`) is well
//! defined and reproducible.

use crate::catalog::ValidatorMetadata;
use crate::stats::ResultStats;
use crate::status::{fold_statuses, TestStatus};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::time::Duration;

/// The result of executing a single validator, or one of its subtests.
///
/// Subtests nest arbitrarily deep (a subtest's `sub_tests` map may itself be
/// non-empty) and their keys are the full path as reported by the event
/// stream (e.g. `"TestFoo/SubA/Nested"`), not just the last path segment.
#[derive(Clone, Debug)]
pub struct TestResult {
    pub metadata: ValidatorMetadata,
    pub status: TestStatus,
    pub duration: Duration,
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub timed_out: bool,
    pub sub_tests: IndexMap<String, TestResult>,
}

impl TestResult {
    /// A synthetic failing result for cases where no subprocess was ever
    /// launched (missing package path, executor panic, listing timeout).
    pub fn synthetic_failure(metadata: ValidatorMetadata, error: impl Into<String>) -> Self {
        Self {
            metadata,
            status: TestStatus::Fail,
            duration: Duration::ZERO,
            error: Some(error.into()),
            stdout: None,
            timed_out: false,
            sub_tests: IndexMap::new(),
        }
    }

    /// Counts this result plus every subtest beneath it, recursively
    /// (invariant 4: "a package test with N subtests contributes 1 + N to
    /// Total" -- the main test itself is one leaf, each subtest is another).
    pub fn leaf_count(&self) -> u64 {
        1 + self
            .sub_tests
            .values()
            .map(TestResult::leaf_count)
            .sum::<u64>()
    }
}

/// An intermediate grouping within a gate.
#[derive(Clone, Debug)]
pub struct SuiteResult {
    pub id: String,
    pub description: String,
    pub tests: IndexMap<String, TestResult>,
    pub status: TestStatus,
    pub duration: Duration,
    pub wall_clock_time: Duration,
    pub stats: ResultStats,
}

impl SuiteResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self::new_at(id, Utc::now())
    }

    pub fn new_at(id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tests: IndexMap::new(),
            // Fail-closed default (invariant 1): becomes Pass/Skip only
            // after finalize().
            status: TestStatus::Fail,
            duration: Duration::ZERO,
            wall_clock_time: Duration::ZERO,
            stats: ResultStats::new(start_time),
        }
    }

    /// Computes the final status per invariant 3/the empty-container rule
    /// (invariant 2) and stamps `Stats.EndTime`.
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        self.status = fold_statuses(self.tests.values().map(|t| t.status));
        self.stats.finish(end_time);
    }
}

/// Top-level grouping of validators; finalized as a single Pass/Fail/Skip.
#[derive(Clone, Debug)]
pub struct GateResult {
    pub id: String,
    pub description: String,
    pub tests: IndexMap<String, TestResult>,
    pub suites: IndexMap<String, SuiteResult>,
    pub status: TestStatus,
    pub duration: Duration,
    pub wall_clock_time: Duration,
    pub stats: ResultStats,
    /// Whether this gate's membership was inherited from a parent gate by
    /// the (external) validator catalog's gate-inheritance flattening.
    pub inherited: bool,
}

impl GateResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self::new_at(id, Utc::now())
    }

    pub fn new_at(id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tests: IndexMap::new(),
            suites: IndexMap::new(),
            status: TestStatus::Fail,
            duration: Duration::ZERO,
            wall_clock_time: Duration::ZERO,
            stats: ResultStats::new(start_time),
            inherited: false,
        }
    }

    /// A gate with zero direct tests and zero suites finalizes to `Skip`,
    /// never `Pass` (invariant 2).
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        let direct = self.tests.values().map(|t| t.status);
        let nested = self.suites.values().map(|s| s.status);
        self.status = fold_statuses(direct.chain(nested));
        self.stats.finish(end_time);
    }
}

/// The result of a complete orchestrator run.
#[derive(Clone, Debug)]
pub struct RunnerResult {
    pub run_id: crate::ids::RunId,
    pub gates: IndexMap<String, GateResult>,
    pub status: TestStatus,
    pub duration: Duration,
    pub wall_clock_time: Duration,
    pub stats: ResultStats,
    pub is_parallel: bool,
}

impl RunnerResult {
    pub fn new(run_id: crate::ids::RunId, is_parallel: bool) -> Self {
        Self::new_at(run_id, is_parallel, Utc::now())
    }

    pub fn new_at(run_id: crate::ids::RunId, is_parallel: bool, start_time: DateTime<Utc>) -> Self {
        Self {
            run_id,
            gates: IndexMap::new(),
            status: TestStatus::Fail,
            duration: Duration::ZERO,
            wall_clock_time: Duration::ZERO,
            stats: ResultStats::new(start_time),
            is_parallel,
        }
    }

    /// The run's overall status is `Fail` if any gate is `Fail`, `Skip` if
    /// every gate is `Skip` (or there are no gates at all), else `Pass`.
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        self.status = fold_statuses(self.gates.values().map(|g| g.status));
        self.stats.finish(end_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ValidatorMetadata, ValidatorType};
    use camino::Utf8PathBuf;

    fn metadata(id: &str) -> ValidatorMetadata {
        ValidatorMetadata {
            id: id.to_string(),
            gate: "gate-a".to_string(),
            suite: None,
            package: Utf8PathBuf::from("./pkg"),
            func_name: Some(id.to_string()),
            run_all: false,
            timeout: Duration::ZERO,
            validator_type: ValidatorType::Acceptance,
        }
    }

    fn leaf(id: &str, status: TestStatus) -> TestResult {
        TestResult {
            metadata: metadata(id),
            status,
            duration: Duration::from_millis(10),
            error: None,
            stdout: None,
            timed_out: false,
            sub_tests: IndexMap::new(),
        }
    }

    #[test]
    fn empty_suite_finalizes_to_skip_not_pass() {
        let mut suite = SuiteResult::new("suite-a");
        suite.finalize(Utc::now());
        assert_eq!(suite.status, TestStatus::Skip);
    }

    #[test]
    fn empty_gate_finalizes_to_skip_not_pass() {
        let mut gate = GateResult::new("gate-a");
        gate.finalize(Utc::now());
        assert_eq!(gate.status, TestStatus::Skip);
    }

    #[test]
    fn gate_fails_if_any_suite_fails() {
        let mut gate = GateResult::new("gate-a");
        let mut ok_suite = SuiteResult::new("suite-ok");
        ok_suite.tests.insert("T1".into(), leaf("T1", TestStatus::Pass));
        ok_suite.finalize(Utc::now());

        let mut bad_suite = SuiteResult::new("suite-bad");
        bad_suite
            .tests
            .insert("T2".into(), leaf("T2", TestStatus::Fail));
        bad_suite.finalize(Utc::now());

        gate.suites.insert("suite-ok".into(), ok_suite);
        gate.suites.insert("suite-bad".into(), bad_suite);
        gate.finalize(Utc::now());
        assert_eq!(gate.status, TestStatus::Fail);
    }

    #[test]
    fn leaf_count_includes_subtests() {
        let mut parent = leaf("TestOne", TestStatus::Pass);
        parent
            .sub_tests
            .insert("TestOne/SubA".into(), leaf("TestOne/SubA", TestStatus::Pass));
        parent
            .sub_tests
            .insert("TestOne/SubB".into(), leaf("TestOne/SubB", TestStatus::Fail));
        assert_eq!(parent.leaf_count(), 3);
    }

    #[test]
    fn fresh_containers_are_fail_closed() {
        assert_eq!(SuiteResult::new("s").status, TestStatus::Fail);
        assert_eq!(GateResult::new("g").status, TestStatus::Fail);
        assert_eq!(
            RunnerResult::new(crate::ids::RunId::new(), false).status,
            TestStatus::Fail
        );
    }
}
