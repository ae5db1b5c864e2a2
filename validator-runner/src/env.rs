// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Environment handoff to test subprocesses.
//!
//! The executor receives a pure function returning environment key/value
//! pairs (orchestrator kind, precondition policy, run-salt); the child
//! process sees the inherited process environment, plus those pairs, plus
//! -- for the `sysext` orchestrator only -- a temp-file path to a
//! serialized devnet environment. The temp file is scoped to one
//! invocation: it is created right before spawn and removed via RAII when
//! its guard drops, which happens on every executor return path including
//! a canceled context.

use camino::Utf8PathBuf;
use camino_tempfile::NamedUtf8TempFile;
use std::io::Write;
use validator_metadata::RunId;

/// Selects how the devnet fixture is provisioned for child processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorKind {
    /// In-process devnet: no extra environment file handoff needed.
    SysGo,
    /// External devnet: children receive a serialized environment file and
    /// a control-scheme override.
    SysExt,
}

impl OrchestratorKind {
    fn as_env_str(self) -> &'static str {
        match self {
            OrchestratorKind::SysGo => "sysgo",
            OrchestratorKind::SysExt => "sysext",
        }
    }
}

/// Everything the environment-handoff layer needs to know to build one
/// child's environment. Constructed once per run and handed to the
/// executor through an `EnvProvider` closure (kept as a closure, not a
/// plain struct reference, so the catalog/config layer outside this crate
/// can recompute values like `run_id`-derived salts lazily).
#[derive(Clone)]
pub struct EnvContext {
    pub orchestrator_kind: OrchestratorKind,
    pub allow_skips: bool,
    pub run_id: RunId,
    pub log_level: String,
    /// Present only when `orchestrator_kind` is `SysExt`: the devnet
    /// environment to serialize into a scoped temp file for the child.
    pub devnet_environment: Option<serde_json::Value>,
    pub control_scheme_override: Option<String>,
}

/// A pure function (no side effects observable by the caller) producing
/// the environment context for one invocation. Boxed so callers can close
/// over whatever catalog/config state they need.
pub type EnvProvider = std::sync::Arc<dyn Fn() -> EnvContext + Send + Sync>;

/// The environment variables to layer on top of the inherited process
/// environment, plus an optional RAII guard for the devnet environment
/// temp file (present only for `SysExt`). Drop the guard only after the
/// child process has exited.
pub struct ChildEnv {
    pub vars: Vec<(String, String)>,
    pub devnet_file_guard: Option<NamedUtf8TempFile>,
}

/// Builds the environment variables for one child invocation, per the
/// stable contract in §6: `DEVSTACK_ORCHESTRATOR`,
/// `DEVNET_EXPECT_PRECONDITIONS_MET` (the logical negation of
/// `allow_skips`), `DEVSTACK_KEYS_SALT` (the run ID), `TEST_LOG_LEVEL`, and
/// -- for `sysext` only -- a devnet environment file path plus a
/// control-scheme override.
pub fn build_child_env(ctx: &EnvContext) -> std::io::Result<ChildEnv> {
    let mut vars = vec![
        (
            "DEVSTACK_ORCHESTRATOR".to_string(),
            ctx.orchestrator_kind.as_env_str().to_string(),
        ),
        (
            "DEVNET_EXPECT_PRECONDITIONS_MET".to_string(),
            (!ctx.allow_skips).to_string(),
        ),
        ("DEVSTACK_KEYS_SALT".to_string(), ctx.run_id.to_string()),
        ("TEST_LOG_LEVEL".to_string(), ctx.log_level.clone()),
    ];

    let mut devnet_file_guard = None;
    if ctx.orchestrator_kind == OrchestratorKind::SysExt {
        if let Some(devnet_environment) = &ctx.devnet_environment {
            let mut file = camino_tempfile::Builder::new()
                .prefix("devnet-env-")
                .suffix(".json")
                .tempfile()?;
            let payload = serde_json::to_vec(devnet_environment)
                .expect("devnet environment value is always serializable JSON");
            file.write_all(&payload)?;
            file.flush()?;

            let path: Utf8PathBuf = file.path().to_path_buf();
            vars.push(("DEVNET_ENVIRONMENT_FILE".to_string(), path.to_string()));
            devnet_file_guard = Some(file);
        }
        if let Some(scheme) = &ctx.control_scheme_override {
            vars.push(("DEVSTACK_CONTROL_SCHEME".to_string(), scheme.clone()));
        }
    }

    Ok(ChildEnv {
        vars,
        devnet_file_guard,
    })
}
