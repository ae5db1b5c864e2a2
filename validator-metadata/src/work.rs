// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::catalog::ValidatorMetadata;

/// A unit of work scheduled for execution, pairing a validator with its
/// destination in the result hierarchy.
///
/// `result_key` is `Package` when the validator runs the whole package
/// (`RunAll`, or no function name given), otherwise `FuncName` (or
/// `Package::FuncName` for adapters that need a package-qualified key, e.g.
/// when the same function name is reused across packages within one gate).
#[derive(Clone, Debug)]
pub struct TestWork {
    pub validator: ValidatorMetadata,
    pub gate_id: String,
    pub suite_id: Option<String>,
    pub result_key: String,
}

impl TestWork {
    pub fn new(validator: ValidatorMetadata, gate_id: impl Into<String>) -> Self {
        let result_key = Self::compute_result_key(&validator);
        Self {
            validator,
            gate_id: gate_id.into(),
            suite_id: None,
            result_key,
        }
    }

    pub fn with_suite(mut self, suite_id: impl Into<String>) -> Self {
        self.suite_id = Some(suite_id.into());
        self
    }

    fn compute_result_key(validator: &ValidatorMetadata) -> String {
        if validator.targets_whole_package() {
            validator.package.to_string()
        } else {
            validator
                .func_name
                .clone()
                .unwrap_or_else(|| validator.package.to_string())
        }
    }
}
