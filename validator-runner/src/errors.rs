// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the runner.
//!
//! The event parser is deliberately excluded: per its contract it never
//! fails, it always produces a (possibly failing) `TestResult` instead.

use camino::Utf8PathBuf;
use itertools::Itertools;
use thiserror::Error;

/// An error produced while executing a single validator.
///
/// This is distinct from a *test failure*: a validator whose test function
/// failed still produces an `Ok(TestResult { status: Fail, .. })`. This
/// error type is for cases where no result could be produced at all.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("package path `{0}` does not exist")]
    PackageNotFound(Utf8PathBuf),

    #[error("failed to spawn test subprocess for `{id}`: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listing tests in `{package}` timed out after {timeout:?}")]
    ListTimeout {
        package: Utf8PathBuf,
        timeout: std::time::Duration,
    },

    #[error("failed to list tests in `{package}`: {source}")]
    ListFailed {
        package: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write devnet environment file: {0}")]
    EnvFileWrite(#[source] std::io::Error),

    #[error("runtime error: {0}")]
    Panic(String),
}

/// An error surfaced by the hierarchy manager. In practice this crate's
/// hierarchy operations are infallible given well-formed `TestWork`, but the
/// type exists so the manager's API can evolve without becoming infallible
/// by convention alone.
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("gate `{0}` was finalized more than once")]
    DoubleFinalize(String),
}

/// Returned by the scheduler either at construction (a malformed
/// concurrency request) or after a run in which one or more work items
/// could not be executed at all (an `ExecuteError`, not a test failure).
/// Test failures are recorded in the result tree and never produce this
/// error.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("parallel execution failed: {failed} of {total} tests failed\n{details}")]
    Aggregated {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("requested concurrency {0} is invalid: must be >= 0 (0 means auto)")]
    InvalidConcurrency(i64),
}

impl SchedulerError {
    const MAX_DETAILED: usize = 3;

    pub(crate) fn aggregate(total: usize, failures: Vec<(String, ExecuteError)>) -> Self {
        let failed = failures.len();
        let mut details = failures
            .iter()
            .take(Self::MAX_DETAILED)
            .map(|(id, err)| format!("  - {id}: {err}"))
            .join("\n");
        let remaining = failures.len().saturating_sub(Self::MAX_DETAILED);
        if remaining > 0 {
            if !details.is_empty() {
                details.push('\n');
            }
            details.push_str(&format!("  ... and {remaining} more"));
        }
        Self::Aggregated {
            failed,
            total,
            details,
        }
    }
}
