// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of a test, subtest, suite, gate, or run.
///
/// `Error` is an internal pseudo-state: it marks that execution failed to
/// produce a result at all (process spawn failure, executor panic). It
/// never appears as a roll-up status on a container -- `fold` below maps
/// it to `Fail` for the purposes of the roll-up rule in invariant 3.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

impl TestStatus {
    /// Whether this status counts as a failure for roll-up purposes.
    /// `Fail` dominates `Skip`, and `Error` is treated as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Error)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, TestStatus::Skip)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
            TestStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Folds a set of child statuses into a single roll-up status, per
/// invariant 3: `Fail` dominates; all-`Skip` (or empty) is `Skip`;
/// otherwise `Pass`.
///
/// An empty iterator yields `Skip`, matching the "empty container finalizes
/// to Skip, never Pass" rule (invariant 2) -- callers at the gate/suite
/// level that have zero children should call this with an empty iterator
/// and get `Skip` back directly.
pub fn fold_statuses<I: IntoIterator<Item = TestStatus>>(statuses: I) -> TestStatus {
    let mut saw_any = false;
    let mut all_skip = true;
    for status in statuses {
        saw_any = true;
        if status.is_failure() {
            return TestStatus::Fail;
        }
        if !status.is_skip() {
            all_skip = false;
        }
    }
    if !saw_any || all_skip {
        TestStatus::Skip
    } else {
        TestStatus::Pass
    }
}
