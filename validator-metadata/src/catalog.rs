// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Catalog entries: the immutable, externally-supplied description of a
//! single validator to execute.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The kind of check a validator performs. Opaque to the scheduler and
/// hierarchy manager; carried through for the benefit of metrics/reporting
/// collaborators (out of scope for this crate).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ValidatorType {
    Acceptance,
    Chaos,
    Benchmark,
    Custom(String),
}

/// An immutable description of a single validator, as produced by the
/// (external) validator catalog.
///
/// If `run_all` is true, `func_name` is ignored and every test function
/// discovered in `package` is executed. If `func_name` is empty and
/// `run_all` is false, the executor targets all tests in `package` in a
/// single subprocess invocation ("package mode").
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidatorMetadata {
    pub id: String,
    pub gate: String,
    pub suite: Option<String>,
    pub package: Utf8PathBuf,
    pub func_name: Option<String>,
    pub run_all: bool,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub validator_type: ValidatorType,
}

impl ValidatorMetadata {
    /// A timeout of zero means "no timeout" throughout this crate (see
    /// `-timeout` subprocess argument handling).
    pub fn has_timeout(&self) -> bool {
        self.timeout > Duration::ZERO
    }

    /// True when the executor must run every test in `package` as one unit
    /// rather than a single named function (either because `run_all` was
    /// requested, or because no function name was supplied at all).
    pub fn targets_whole_package(&self) -> bool {
        self.run_all || self.func_name.as_deref().unwrap_or("").is_empty()
    }
}
