// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::status::TestStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Running counters for a container (run, gate, or suite).
///
/// `Total` always equals `Passed + Failed + Skipped` and counts leaf test
/// results including subtests (invariant 3/4 in the result hierarchy).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultStats {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ResultStats {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            start_time,
            end_time: None,
        }
    }

    /// Records one leaf test result (a test or subtest with no children of
    /// its own) against these stats. `Error` is counted as `Failed`.
    pub fn record_leaf(&mut self, status: TestStatus) {
        self.total += 1;
        match status {
            TestStatus::Pass => self.passed += 1,
            TestStatus::Fail | TestStatus::Error => self.failed += 1,
            TestStatus::Skip => self.skipped += 1,
        }
    }

    pub fn finish(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
    }

    /// `Stats.Total == Stats.Passed + Stats.Failed + Stats.Skipped` always
    /// holds once every recorded leaf has gone through `record_leaf`.
    pub fn is_consistent(&self) -> bool {
        self.total == self.passed + self.failed + self.skipped
    }
}
