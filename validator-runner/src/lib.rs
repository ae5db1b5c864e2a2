// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The core engine of the acceptance-test orchestrator.
//!
//! Three tightly coupled subsystems, assembled by a [`coordinator`]:
//!
//! - [`parser`]: turns a test subprocess's line-delimited JSON event stream
//!   into a [`validator_metadata::TestResult`] tree.
//! - [`executor`]: spawns one subprocess per validator, supervises its
//!   timeout, and hands captured output to the parser.
//! - [`hierarchy`]: materializes gates/suites/tests/subtests and computes
//!   roll-up statuses.
//!
//! A [`scheduler`] drives many [`executor::Executor`] calls concurrently
//! over a bounded worker pool; [`coordinator::Coordinator`] chooses between
//! the serial and parallel paths.

pub mod coordinator;
pub mod env;
pub mod errors;
pub mod executor;
pub mod hierarchy;
pub mod parser;
pub mod scheduler;
pub mod sinks;

pub use coordinator::Coordinator;
pub use errors::{ExecuteError, HierarchyError, SchedulerError};
pub use executor::Executor;
pub use scheduler::{CancellationToken, ParallelScheduler, SchedulerConfig};
