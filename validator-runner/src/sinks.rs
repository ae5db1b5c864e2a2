// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! External collaborator interfaces.
//!
//! These are contracts only -- configuration/registry loading, file-based
//! logging, metrics emission, and terminal UI progress widgets are thin
//! wrappers living outside this crate (see §1 of the design: "deliberately
//! out of scope"). What lives here is just the shape those collaborators
//! must fill, plus a no-op implementation of each for callers (and tests)
//! that don't need one.

use std::collections::HashMap;
use std::sync::Mutex;
use validator_metadata::{RunId, TestStatus};

/// Keyed byte store for per-test raw event archives, for post-mortem
/// inspection. Implementations must tolerate concurrent calls -- the
/// executor may be invoked from many scheduler workers at once.
pub trait RawJsonSink: Send + Sync {
    fn store(&self, test_id: &str, bytes: &[u8]);
    fn get(&self, test_id: &str) -> Option<Vec<u8>>;
}

/// Persists a finished result somewhere durable (a JSON file tree, a
/// database row, ...). Out of scope to implement here; this is the shape
/// an external file-result sink must fill.
pub trait FileResultSink: Send + Sync {
    fn log_test_result(&self, result: &validator_metadata::TestResult, run_id: RunId);
}

/// Records a single validation outcome to an external metrics backend.
pub trait MetricsSink: Send + Sync {
    fn record_validation(
        &self,
        network: &str,
        run_id: RunId,
        validator_id: &str,
        validator_type: &validator_metadata::ValidatorType,
        status: TestStatus,
    );
}

/// Observer of gate/suite/test lifecycle events, for UI purposes. Must be
/// safe for concurrent `start_test`/`update_test` calls from scheduler
/// workers.
pub trait ProgressSink: Send + Sync {
    fn start_gate(&self, _name: &str, _total: usize) {}
    fn start_suite(&self, _name: &str, _total: usize) {}
    fn start_test(&self, _name: &str) {}
    fn update_test(&self, _name: &str, _status: TestStatus) {}
    fn complete_suite(&self, _name: &str) {}
    fn complete_gate(&self, _name: &str) {}
}

/// A tracing span scope, used to bracket one unit of work for an external
/// tracer. `end` is called exactly once, regardless of the outcome.
pub trait Tracer: Send + Sync {
    fn start(&self, span_name: &str) -> Box<dyn FnOnce() + Send>;
}

/// The do-nothing implementation of every sink above, for callers that
/// don't wire up any of the external collaborators (unit tests, the
/// scenarios in this crate's own test suite).
#[derive(Default)]
pub struct NoopSinks;

impl ProgressSink for NoopSinks {}

impl Tracer for NoopSinks {
    fn start(&self, _span_name: &str) -> Box<dyn FnOnce() + Send> {
        Box::new(|| {})
    }
}

/// A simple mutex-guarded in-memory `RawJsonSink`, sufficient for tests and
/// for small runs; `RawJsonSink` only requires that implementations
/// tolerate concurrent calls, which a single mutex around a map satisfies.
#[derive(Default)]
pub struct InMemoryRawJsonSink {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl RawJsonSink for InMemoryRawJsonSink {
    fn store(&self, test_id: &str, bytes: &[u8]) {
        self.inner
            .lock()
            .expect("raw json sink mutex poisoned")
            .insert(test_id.to_string(), bytes.to_vec());
    }

    fn get(&self, test_id: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("raw json sink mutex poisoned")
            .get(test_id)
            .cloned()
    }
}
